//! The construct state machine: the central orchestrator that cycles the
//! agent through INVESTIGATE -> BUILD -> VERIFY, with DECOMPOSE as a
//! recovery path and bounded batch-failure recovery.

pub mod metrics;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::executor::AgentExecutor;
use crate::model::{Priority, Task};
use crate::orch_state::{self, OrchestrationState, Stage};
use crate::reconcile::{self, ReconcileResult};
use crate::scheduler;
use crate::stages::prompt::{load_with_project_rules, render};
use crate::stages::{StageOutcome, StageResult};
use crate::ticket_store::TicketStore;

use metrics::{LoopDetector, Metrics};

/// Why a construct run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    SpecComplete,
    MaxIterations,
    WallClock,
    MaxCost,
    MaxTokens,
    MaxApiCalls,
    ConsecutiveFailures,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::SpecComplete => "spec_complete",
            ExitReason::MaxIterations => "max_iterations",
            ExitReason::WallClock => "max_wall_time",
            ExitReason::MaxCost => "max_cost",
            ExitReason::MaxTokens => "max_tokens",
            ExitReason::MaxApiCalls => "max_api_calls",
            ExitReason::ConsecutiveFailures => "consecutive_failures",
        }
    }
}

pub struct ConstructStateMachine {
    config: GlobalConfig,
    ticket_store: Arc<dyn TicketStore>,
    executor: Arc<dyn AgentExecutor>,
    repo_root: PathBuf,
    prompts_dir: PathBuf,
    state_path: PathBuf,
    agent: Option<String>,
    pub metrics: Metrics,
    /// The most recently recorded stage result, for the CLI's construct
    /// loop to read after each `run_iteration` call and write to the
    /// iteration ledger. Cleared by nothing — callers take it with
    /// `.take()` if they want single-use semantics.
    pub last_stage_result: Option<StageResult>,
    /// The reconciliation tallies behind `last_stage_result`, since
    /// `StageResult` itself only carries the joined error string.
    pub last_reconcile_result: Option<ReconcileResult>,
    loop_detector: LoopDetector,
    retry_counts: HashMap<String, u32>,
    batch_failure_count: u32,
    consecutive_failures: u32,
    started_at: Instant,
}

impl ConstructStateMachine {
    pub fn new(
        config: GlobalConfig,
        ticket_store: Arc<dyn TicketStore>,
        executor: Arc<dyn AgentExecutor>,
        repo_root: impl Into<PathBuf>,
        prompts_dir: impl Into<PathBuf>,
        state_path: impl Into<PathBuf>,
    ) -> Self {
        let threshold = config.loop_detection_threshold;
        ConstructStateMachine {
            config,
            ticket_store,
            executor,
            repo_root: repo_root.into(),
            prompts_dir: prompts_dir.into(),
            state_path: state_path.into(),
            agent: None,
            metrics: Metrics::default(),
            last_stage_result: None,
            last_reconcile_result: None,
            loop_detector: LoopDetector::new(threshold),
            retry_counts: HashMap::new(),
            batch_failure_count: 0,
            consecutive_failures: 0,
            started_at: Instant::now(),
        }
    }

    /// Override the agent profile passed to every stage invocation for the
    /// rest of this run (the `--agent A` half of the agent invocation
    /// contract, alongside the existing per-run model override).
    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }

    fn load_state(&self) -> OrchestrationState {
        orch_state::load(&self.state_path)
    }

    fn save_state(&self, state: &OrchestrationState) -> std::io::Result<()> {
        orch_state::save(&self.state_path, state)
    }

    /// Batch size after halving once per consecutive batch failure, floored at 1.
    pub fn effective_batch_size(&self, nominal: u32) -> u32 {
        let divisor = 1u32.checked_shl(self.batch_failure_count).unwrap_or(u32::MAX);
        (nominal / divisor.max(1)).max(1)
    }

    /// Check the global budgets. Returns the first exceeded budget, if any.
    pub fn check_budgets(&self) -> Option<ExitReason> {
        if self.metrics.total_iterations >= self.config.max_iterations {
            return Some(ExitReason::MaxIterations);
        }
        if self.started_at.elapsed().as_secs() >= self.config.max_wall_time_s {
            return Some(ExitReason::WallClock);
        }
        if self.metrics.total_cost >= self.config.max_cost {
            return Some(ExitReason::MaxCost);
        }
        if self.metrics.tokens_used() >= self.config.max_tokens {
            return Some(ExitReason::MaxTokens);
        }
        if self.metrics.api_calls_remote + self.metrics.api_calls_local >= self.config.max_api_calls {
            return Some(ExitReason::MaxApiCalls);
        }
        if self.consecutive_failures > self.config.max_failures {
            return Some(ExitReason::ConsecutiveFailures);
        }
        None
    }

    /// Run one construct iteration. Returns `(should_continue, spec_complete)`.
    pub async fn run_iteration(&mut self, iteration: u32) -> (bool, bool) {
        let mut state = self.load_state();

        if state.spec.is_none() {
            return (false, false);
        }
        if state.stage == Stage::Complete {
            return (false, true);
        }

        if let Some(seconds) = self.metrics.seconds_since_progress() {
            if seconds >= self.config.progress_stall_warn_s as f64 {
                warn!(seconds, "no progress recorded recently");
            }
        }

        let spec_file = state.spec.clone().unwrap_or_default();

        let outcome = match state.stage {
            Stage::Decompose => self.run_decompose(&mut state, &spec_file).await,
            Stage::Investigate => self.run_investigate(&mut state, &spec_file).await,
            Stage::Build => self.run_build(&mut state, &spec_file).await,
            Stage::Verify => self.run_verify(&mut state).await,
            Stage::Plan | Stage::Complete => {
                self.compute_initial_stage(&mut state).await;
                let _ = self.save_state(&state);
                return (true, false);
            }
        };

        let _ = self.save_state(&state);
        iteration_info(iteration, &state.stage);
        outcome
    }

    async fn compute_initial_stage(&self, state: &mut OrchestrationState) {
        let issues = self.ticket_store.list_issues().await.unwrap_or_default();
        if !issues.is_empty() {
            state.transition_to_investigate();
            return;
        }
        let pending = self.ticket_store.list_pending().await.unwrap_or_default();
        if !pending.is_empty() {
            state.transition_to_build();
            return;
        }
        let done = self.ticket_store.list_done().await.unwrap_or_default();
        if !done.is_empty() {
            state.transition_to_verify();
            return;
        }
        state.transition_to_complete();
    }

    // -- DECOMPOSE ------------------------------------------------------

    async fn run_decompose(&mut self, state: &mut OrchestrationState, spec_file: &str) -> (bool, bool) {
        let Some(target_id) = state.decompose_target.clone() else {
            state.transition_to_investigate();
            return (true, false);
        };
        let pending = self.ticket_store.list_pending().await.unwrap_or_default();
        let Some(parent) = pending.iter().find(|t| t.id == target_id).cloned() else {
            state.transition_to_investigate();
            return (true, false);
        };

        let mut vars = HashMap::new();
        vars.insert("spec_file".to_string(), spec_file.to_string());
        vars.insert("task_name".to_string(), parent.name.clone());
        if let Some(log) = &state.kill_log {
            vars.insert(
                "kill_log".to_string(),
                crate::stages::truncate_kill_log(log, 50, 100),
            );
        }
        if let Some(reason) = &state.kill_reason {
            vars.insert("kill_reason".to_string(), reason.clone());
        }

        let store = self.ticket_store.clone();
        let parent_clone = parent.clone();
        let spec_file_owned = spec_file.to_string();
        let result = self
            .run_stage(Stage::Decompose, &vars, Some(target_id.clone()), move |value| {
                Box::pin(async move {
                    reconcile::reconcile_decompose(store.as_ref(), &value, &parent_clone, &spec_file_owned).await
                })
            })
            .await;

        self.record_result(&result);
        // Regardless of outcome, decompose always hands control back to
        // INVESTIGATE and clears the target.
        state.transition_to_investigate();
        (true, false)
    }

    // -- INVESTIGATE ------------------------------------------------------

    async fn run_investigate(&mut self, state: &mut OrchestrationState, spec_file: &str) -> (bool, bool) {
        loop {
            let mut issues = self.ticket_store.list_issues().await.unwrap_or_default();
            if issues.is_empty() {
                state.transition_to_build();
                return (true, false);
            }

            let duplicates = scheduler::find_duplicate_issues(&issues, self.config.issue_similarity_threshold);
            if !duplicates.is_empty() {
                let _ = self.ticket_store.issue_done_ids(&duplicates).await;
                issues.retain(|i| !duplicates.contains(&i.id));
            }

            let batch_size = self.effective_batch_size(self.config.investigate_batch_size) as usize;
            let batch: Vec<String> = issues.iter().take(batch_size).map(|i| i.id.clone()).collect();
            state.batch_items = batch.clone();

            let mut vars = HashMap::new();
            vars.insert("spec_file".to_string(), spec_file.to_string());
            vars.insert("issue_ids".to_string(), batch.join(", "));

            let store = self.ticket_store.clone();
            let spec_file_owned = spec_file.to_string();
            let batch_id = Some(batch.join(","));
            let result = self
                .run_stage(Stage::Investigate, &vars, batch_id, move |value| {
                    Box::pin(async move { reconcile::reconcile_investigate(store.as_ref(), &value, &spec_file_owned).await })
                })
                .await;

            self.record_result(&result);

            match result.outcome {
                StageOutcome::Failure => {
                    let (cont, complete) = self.handle_batch_failure(&batch, state, "INVESTIGATE").await;
                    if !cont {
                        return (cont, complete);
                    }
                    continue;
                }
                StageOutcome::Success => {
                    state.completed_batch_items = batch;
                    state.batch_items.clear();
                    self.batch_failure_count = 0;
                    continue;
                }
                StageOutcome::Skip => {
                    state.transition_to_build();
                    return (true, false);
                }
            }
        }
    }

    // -- BUILD ------------------------------------------------------

    async fn run_build(&mut self, state: &mut OrchestrationState, spec_file: &str) -> (bool, bool) {
        let pending = self.ticket_store.list_pending().await.unwrap_or_default();
        self.escalate_stuck_tasks(&pending).await;
        let pending = self.ticket_store.list_pending().await.unwrap_or_default();
        let completed_ids: std::collections::HashSet<String> = self
            .ticket_store
            .list_done()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.id)
            .collect();
        let Some(task) = scheduler::pick_best_task(&pending, &completed_ids, &self.retry_counts).cloned() else {
            state.transition_to_verify();
            return (true, false);
        };

        let mut vars = HashMap::new();
        vars.insert("spec_file".to_string(), spec_file.to_string());
        vars.insert("task_name".to_string(), task.name.clone());
        vars.insert("task_spec".to_string(), task.spec.clone());
        if let Some(notes) = &task.notes {
            vars.insert("task_notes".to_string(), notes.clone());
        }
        if let Some(reason) = &task.reject_reason {
            vars.insert("previous_reject_reason".to_string(), reason.clone());
        }

        let task_id = task.id.clone();
        let store = self.ticket_store.clone();
        let task_id_owned = task_id.clone();
        let spec_file_owned = spec_file.to_string();
        let result = self
            .run_stage(Stage::Build, &vars, Some(task_id.clone()), move |value| {
                Box::pin(async move {
                    reconcile::reconcile_build(store.as_ref(), &value, &task_id_owned, &spec_file_owned).await
                })
            })
            .await;

        self.record_result(&result);

        match result.outcome {
            StageOutcome::Failure => {
                self.consecutive_failures += 1;
                *self.retry_counts.entry(task.id.clone()).or_insert(0) += 1;
                self.handle_task_failure(&result, state, &task).await;
                (true, false)
            }
            _ => {
                self.consecutive_failures = 0;
                state.transition_to_verify();
                (true, false)
            }
        }
    }

    // -- VERIFY ------------------------------------------------------

    async fn run_verify(&mut self, state: &mut OrchestrationState) -> (bool, bool) {
        loop {
            let done = self.ticket_store.list_done().await.unwrap_or_default();
            if done.is_empty() {
                return self.finalize_verify_stage(state).await;
            }

            let auto_accepted = self.acceptance_precheck(&done).await;
            let remaining: Vec<&Task> = done.iter().filter(|t| !auto_accepted.contains(&t.id)).collect();
            if remaining.is_empty() {
                continue;
            }

            let batch_size = self.effective_batch_size(self.config.verify_batch_size) as usize;
            let batch: Vec<String> = remaining.iter().take(batch_size).map(|t| t.id.clone()).collect();
            state.batch_items = batch.clone();

            let mut vars = HashMap::new();
            vars.insert("task_ids".to_string(), batch.join(", "));

            let store = self.ticket_store.clone();
            let batch_id = Some(batch.join(","));
            let result = self
                .run_stage(Stage::Verify, &vars, batch_id, move |value| {
                    Box::pin(async move { reconcile::reconcile_verify(store.as_ref(), &value).await })
                })
                .await;

            self.record_result(&result);

            match result.outcome {
                StageOutcome::Failure => {
                    let (cont, complete) = self.handle_batch_failure(&batch, state, "VERIFY").await;
                    if !cont {
                        return (cont, complete);
                    }
                    continue;
                }
                StageOutcome::Success => {
                    state.completed_batch_items = batch;
                    state.batch_items.clear();
                    self.batch_failure_count = 0;
                    continue;
                }
                StageOutcome::Skip => return self.finalize_verify_stage(state).await,
            }
        }
    }

    async fn finalize_verify_stage(&mut self, state: &mut OrchestrationState) -> (bool, bool) {
        let pending = self.ticket_store.list_pending().await.unwrap_or_default();
        let issues = self.ticket_store.list_issues().await.unwrap_or_default();
        if pending.is_empty() && issues.is_empty() {
            state.transition_to_complete();
            (true, true)
        } else {
            state.transition_to_investigate();
            (true, false)
        }
    }

    // -- Failure handlers ------------------------------------------------

    async fn handle_task_failure(&mut self, result: &StageResult, state: &mut OrchestrationState, task: &Task) {
        if task.decompose_depth >= self.config.max_decompose_depth {
            let desc = format!(
                "task {} exceeded max decompose depth after failure: {}",
                task.id,
                result.kill_reason.as_deref().unwrap_or("unknown")
            );
            let _ = self.ticket_store.issue_add(&desc, Some(Priority::High)).await;
            let _ = self
                .ticket_store
                .task_reject(&task.id, "max decompose depth exceeded")
                .await;
            return;
        }

        state.transition_to_decompose(
            task.id.clone(),
            result.kill_reason.clone().unwrap_or_else(|| "build failed".to_string()),
            result.kill_log.clone(),
        );
    }

    async fn handle_batch_failure(
        &mut self,
        batch: &[String],
        state: &mut OrchestrationState,
        stage_name: &str,
    ) -> (bool, bool) {
        self.batch_failure_count += 1;

        if batch.len() > 1 {
            state.batch_items.clear();
        } else if let Some(item_id) = batch.first() {
            match stage_name {
                "INVESTIGATE" => {
                    let _ = self.ticket_store.issue_done_ids(std::slice::from_ref(item_id)).await;
                }
                "VERIFY" => {
                    let _ = self
                        .ticket_store
                        .task_reject(item_id, "verify batch failed")
                        .await;
                }
                _ => {}
            }
            state.batch_items.clear();
        }

        if self.batch_failure_count > self.config.max_failures {
            return (false, false);
        }
        (true, false)
    }

    // -- Pure helpers ------------------------------------------------

    async fn acceptance_precheck(&self, done: &[Task]) -> Vec<String> {
        let mut accepted = Vec::new();
        for task in done {
            let Some(accept) = &task.accept else { continue };
            if !scheduler::looks_like_command(accept) {
                continue;
            }
            if run_acceptance_command(accept, &self.repo_root).await {
                if self.ticket_store.task_accept(Some(&task.id)).await.is_ok() {
                    accepted.push(task.id.clone());
                }
            }
        }
        accepted
    }

    /// Convert pending tasks stuck beyond the retry ceiling into issues,
    /// so a task the agent cannot complete doesn't livelock the run.
    pub async fn escalate_stuck_tasks(&mut self, pending: &[Task]) {
        for task in pending {
            let retries = self.retry_counts.get(&task.id).copied().unwrap_or(0);
            if retries >= self.config.max_retries_per_task {
                let reason = format!(
                    "task {} retried {} times without success; last reason: {}",
                    task.id,
                    retries,
                    task.reject_reason.as_deref().unwrap_or("unknown")
                );
                let _ = self.ticket_store.issue_add(&reason, None).await;
                let _ = self.ticket_store.task_reject(&task.id, &reason).await;
                self.retry_counts.remove(&task.id);
            }
        }
    }

    fn record_result(&mut self, result: &StageResult) {
        let is_local = self.config.model.is_empty();
        self.metrics.record_stage_result(result, is_local);
        if result.outcome == StageOutcome::Success {
            self.metrics.record_progress();
        }
        self.last_stage_result = Some(result.clone());
    }

    /// Loop-detection fingerprint: the stage plus a stable summary of the
    /// ticket store's visible contents (sorted pending/done/issue IDs), not
    /// the agent's free-form output text, since two genuinely stuck
    /// iterations rarely produce byte-identical transcripts even when the
    /// ticket store hasn't moved at all.
    async fn ticket_store_fingerprint(&self, stage: Stage) -> String {
        let mut pending: Vec<String> = self.ticket_store.list_pending().await.unwrap_or_default().into_iter().map(|t| t.id).collect();
        let mut done: Vec<String> = self.ticket_store.list_done().await.unwrap_or_default().into_iter().map(|t| t.id).collect();
        let mut issues: Vec<String> = self.ticket_store.list_issues().await.unwrap_or_default().into_iter().map(|i| i.id).collect();
        pending.sort();
        done.sort();
        issues.sort();
        format!("{stage:?}:{}:{}:{}", pending.join(","), done.join(","), issues.join(","))
    }

    /// The shared five-step stage skeleton: load prompt, run the agent,
    /// extract structured output, reconcile via the stage-specific
    /// callback, and classify the outcome. Loop detection runs after a
    /// successful invocation; a detected repeat rewrites the outcome to
    /// FAILURE with `kill_reason = loop_detected`.
    async fn run_stage<'a, F>(
        &'a mut self,
        stage: Stage,
        vars: &HashMap<String, String>,
        task_id: Option<String>,
        reconcile_fn: F,
    ) -> StageResult
    where
        F: FnOnce(serde_json::Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = ReconcileResult> + Send + 'a>>,
    {
        let filename = crate::stages::prompt_filename(stage);
        let template = match load_with_project_rules(&self.prompts_dir, filename, &self.repo_root) {
            Ok(t) => t,
            Err(e) => {
                return StageResult {
                    stage,
                    outcome: StageOutcome::Failure,
                    exit_code: -1,
                    duration_seconds: 0.0,
                    cost: 0.0,
                    tokens_used: 0,
                    kill_reason: None,
                    kill_log: None,
                    task_id,
                    error: Some(format!("failed to load prompt template: {e}")),
                };
            }
        };
        let prompt = render(&template, vars);

        let started = Instant::now();
        let model = if self.config.model.is_empty() { None } else { Some(self.config.model.as_str()) };
        let agent = self.agent.as_deref();
        let exec_result = self
            .executor
            .run_stage(stage, &prompt, &self.repo_root, self.config.stage_timeout_ms, model, agent)
            .await;
        let duration = started.elapsed().as_secs_f64();

        let exec_result = match exec_result {
            Ok(r) => r,
            Err(e) => {
                return StageResult {
                    stage,
                    outcome: StageOutcome::Failure,
                    exit_code: -1,
                    duration_seconds: duration,
                    cost: 0.0,
                    tokens_used: 0,
                    kill_reason: Some("executor_error".to_string()),
                    kill_log: None,
                    task_id,
                    error: Some(e.to_string()),
                };
            }
        };

        self.metrics.record_tokens(
            exec_result.metrics.tokens_in,
            exec_result.metrics.tokens_cache_read,
            exec_result.metrics.tokens_out,
        );

        let structured = reconcile::extract_structured_output(&exec_result.output);
        let had_structured_output = structured.is_some();
        let reconcile_result = match structured {
            Some(value) => reconcile_fn(value).await,
            None => ReconcileResult::default(),
        };
        let progressed = reconcile::made_progress(&reconcile_result);
        self.last_reconcile_result = Some(reconcile_result.clone());

        let mut outcome = crate::stages::classify_outcome(
            exec_result.exit_code,
            exec_result.timed_out,
            had_structured_output,
            progressed,
        );

        let mut kill_reason = if exec_result.timed_out {
            Some("timeout".to_string())
        } else if outcome == StageOutcome::Failure {
            Some("stage_failed".to_string())
        } else {
            None
        };

        if outcome == StageOutcome::Success {
            let fingerprint = self.ticket_store_fingerprint(stage).await;
            if self.loop_detector.check_output(&fingerprint) {
                self.metrics.kills_loop += 1;
                outcome = StageOutcome::Failure;
                kill_reason = Some("loop_detected".to_string());
            }
        }

        StageResult {
            stage,
            outcome,
            exit_code: exec_result.exit_code,
            duration_seconds: duration,
            cost: exec_result.metrics.cost,
            tokens_used: exec_result.metrics.tokens_used(),
            kill_reason,
            kill_log: if exec_result.timed_out { Some(exec_result.output.clone()) } else { None },
            task_id,
            error: if reconcile_result.errors.is_empty() { None } else { Some(reconcile_result.errors.join("; ")) },
        }
    }
}

async fn run_acceptance_command(command: &str, cwd: &Path) -> bool {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.current_dir(cwd);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let Ok(child) = cmd.spawn() else { return false };
    match tokio::time::timeout(std::time::Duration::from_secs(30), child.wait_with_output()).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

fn iteration_info(iteration: u32, stage: &Stage) {
    info!(iteration, stage = %stage, "iteration complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_batch_size_halves_per_failure_with_floor_one() {
        let sm = ConstructStateMachine::new(
            GlobalConfig::default(),
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        assert_eq!(sm.effective_batch_size(8), 8);
    }

    #[test]
    fn effective_batch_size_floors_at_one_after_many_failures() {
        let mut sm = ConstructStateMachine::new(
            GlobalConfig::default(),
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        sm.batch_failure_count = 10;
        assert_eq!(sm.effective_batch_size(8), 1);
    }

    #[test]
    fn check_budgets_flags_max_iterations() {
        let mut config = GlobalConfig::default();
        config.max_iterations = 5;
        let mut sm = ConstructStateMachine::new(
            config,
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        sm.metrics.total_iterations = 5;
        assert_eq!(sm.check_budgets(), Some(ExitReason::MaxIterations));
    }

    #[test]
    fn check_budgets_flags_consecutive_failures() {
        let mut config = GlobalConfig::default();
        config.max_failures = 2;
        let mut sm = ConstructStateMachine::new(
            config,
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        sm.consecutive_failures = 3;
        assert_eq!(sm.check_budgets(), Some(ExitReason::ConsecutiveFailures));
    }

    #[test]
    fn check_budgets_clear_when_nothing_exceeded() {
        let sm = ConstructStateMachine::new(
            GlobalConfig::default(),
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        assert_eq!(sm.check_budgets(), None);
    }

    struct NullTicketStore;
    #[async_trait::async_trait]
    impl TicketStore for NullTicketStore {
        async fn list_pending(&self) -> Result<Vec<Task>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn list_done(&self) -> Result<Vec<Task>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn list_issues(&self) -> Result<Vec<crate::model::Issue>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn task_add(&self, _task: &Task) -> Result<String, crate::ticket_store::TixError> {
            Ok("t-stub".to_string())
        }
        async fn task_batch_add(&self, _tasks: &[Task]) -> Result<Vec<String>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn task_done(&self, _id: Option<&str>) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn task_accept(&self, _id: Option<&str>) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn task_reject(&self, _id: &str, _reason: &str) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn task_delete(&self, _id: &str) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn task_prioritize(&self, _id: &str, _priority: Priority) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn issue_add(&self, _desc: &str, _priority: Option<Priority>) -> Result<String, crate::ticket_store::TixError> {
            Ok("i-stub".to_string())
        }
        async fn issue_done(&self, _id: &str) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn issue_done_all(&self) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn issue_done_ids(&self, _ids: &[String]) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn validate(&self) -> Result<bool, crate::ticket_store::TixError> {
            Ok(true)
        }
        async fn status(&self) -> Result<String, crate::ticket_store::TixError> {
            Ok(String::new())
        }
        async fn is_available(&self) -> bool {
            true
        }
    }

    struct NullExecutor;
    #[async_trait::async_trait]
    impl AgentExecutor for NullExecutor {
        async fn run_stage(
            &self,
            _stage: Stage,
            _prompt: &str,
            _cwd: &Path,
            _timeout_ms: u64,
            _model: Option<&str>,
            _agent: Option<&str>,
        ) -> Result<crate::executor::ExecResult, crate::executor::ExecutorError> {
            Ok(crate::executor::ExecResult {
                exit_code: 0,
                output: String::new(),
                timed_out: false,
                metrics: crate::executor::ExecMetrics::default(),
            })
        }
    }

    /// Records every call it receives instead of doing anything, so tests
    /// can assert on which ticket-store operations a code path invoked.
    #[derive(Default)]
    struct TrackingStore {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TicketStore for TrackingStore {
        async fn list_pending(&self) -> Result<Vec<Task>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn list_done(&self) -> Result<Vec<Task>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn list_issues(&self) -> Result<Vec<crate::model::Issue>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn task_add(&self, _task: &Task) -> Result<String, crate::ticket_store::TixError> {
            Ok("t-stub".to_string())
        }
        async fn task_batch_add(&self, _tasks: &[Task]) -> Result<Vec<String>, crate::ticket_store::TixError> {
            Ok(vec![])
        }
        async fn task_done(&self, _id: Option<&str>) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn task_accept(&self, _id: Option<&str>) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn task_reject(&self, id: &str, _reason: &str) -> Result<(), crate::ticket_store::TixError> {
            self.calls.lock().unwrap().push(format!("task_reject:{id}"));
            Ok(())
        }
        async fn task_delete(&self, id: &str) -> Result<(), crate::ticket_store::TixError> {
            self.calls.lock().unwrap().push(format!("task_delete:{id}"));
            Ok(())
        }
        async fn task_prioritize(&self, _id: &str, _priority: Priority) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn issue_add(&self, desc: &str, _priority: Option<Priority>) -> Result<String, crate::ticket_store::TixError> {
            self.calls.lock().unwrap().push(format!("issue_add:{desc}"));
            Ok("i-stub".to_string())
        }
        async fn issue_done(&self, _id: &str) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn issue_done_all(&self) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn issue_done_ids(&self, _ids: &[String]) -> Result<(), crate::ticket_store::TixError> {
            Ok(())
        }
        async fn validate(&self) -> Result<bool, crate::ticket_store::TixError> {
            Ok(true)
        }
        async fn status(&self) -> Result<String, crate::ticket_store::TixError> {
            Ok(String::new())
        }
        async fn is_available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn escalate_stuck_tasks_rejects_instead_of_deleting_and_clears_retry_count() {
        let store = Arc::new(TrackingStore::default());
        let mut sm = ConstructStateMachine::new(
            GlobalConfig::default(),
            store.clone(),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        sm.retry_counts.insert("t-stuck".to_string(), 3);
        let task = Task::new("t-stuck".to_string(), "stuck task".to_string(), "spec.md");
        sm.escalate_stuck_tasks(std::slice::from_ref(&task)).await;

        let calls = store.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("task_reject:t-stuck")));
        assert!(!calls.iter().any(|c| c.starts_with("task_delete:t-stuck")));
        assert!(calls.iter().any(|c| c.starts_with("issue_add:")));
        drop(calls);
        assert!(!sm.retry_counts.contains_key("t-stuck"));
    }

    #[tokio::test]
    async fn ticket_store_fingerprint_is_stable_for_unchanged_store_contents() {
        let sm = ConstructStateMachine::new(
            GlobalConfig::default(),
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        let a = sm.ticket_store_fingerprint(Stage::Build).await;
        let b = sm.ticket_store_fingerprint(Stage::Build).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn ticket_store_fingerprint_differs_across_stages() {
        let sm = ConstructStateMachine::new(
            GlobalConfig::default(),
            Arc::new(NullTicketStore),
            Arc::new(NullExecutor),
            "/tmp",
            "/tmp",
            "/tmp/state.json",
        );
        let build = sm.ticket_store_fingerprint(Stage::Build).await;
        let verify = sm.ticket_store_fingerprint(Stage::Verify).await;
        assert_ne!(build, verify);
    }
}
