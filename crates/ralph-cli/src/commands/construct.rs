//! `ralph construct`: drive the construct loop for a bounded number of
//! iterations, enforcing the global budgets and recording a run in the
//! ledger. `ConstructStateMachine` dispatches individual iterations but
//! never checks budgets or writes the ledger on its own — that belongs
//! here, one level up.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use ralph_core::executor::OpencodeExecutor;
use ralph_core::ledger::{self, IterationRecord, RunRecord, TokenBreakdown};
use ralph_core::orch_state::{self, OrchestrationState};
use ralph_core::ticket_store::TixClient;
use ralph_core::{ConstructStateMachine, TicketStore};

use crate::paths::Paths;

pub async fn run(
    repo_root: &Path,
    iterations: Option<u32>,
    spec: Option<String>,
    model: Option<&str>,
    agent: Option<&str>,
) -> anyhow::Result<()> {
    let mut config = ralph_core::config::load();
    if let Some(model) = model {
        config.model = model.to_string();
    }
    let paths = Paths::resolve(repo_root, &config);

    if let Some(spec) = &spec {
        let spec_path = repo_root.join(spec);
        if !spec_path.exists() {
            anyhow::bail!("spec file not found: {}", spec_path.display());
        }
        let mut state = orch_state::load(&paths.state_path);
        if state.spec.as_deref() != Some(spec.as_str()) {
            state = OrchestrationState::new(spec.clone());
        }
        orch_state::save(&paths.state_path, &state)
            .with_context(|| format!("failed to write {}", paths.state_path.display()))?;
    }

    let state = orch_state::load(&paths.state_path);
    let Some(active_spec) = state.spec.clone() else {
        anyhow::bail!("no active spec; run `ralph plan <spec>` or pass one to `ralph construct`");
    };

    let max_iterations = iterations.unwrap_or(config.max_iterations);
    let branch = ralph_core::git::current_branch(repo_root).await;
    let git_sha_start = ralph_core::git::current_commit(repo_root).await;
    let started_at = chrono::Utc::now();
    let run_id = ledger::new_run_id(&started_at.format("%Y%m%d_%H%M%S").to_string());

    let ticket_store: Arc<dyn TicketStore> = Arc::new(TixClient::new(repo_root));
    let executor: Arc<dyn ralph_core::executor::AgentExecutor> = Arc::new(OpencodeExecutor::new());
    let mut machine = ConstructStateMachine::new(
        config.clone(),
        ticket_store.clone(),
        executor,
        repo_root,
        paths.ralph_dir.clone(),
        paths.state_path.clone(),
    )
    .with_agent(agent.map(str::to_string));

    let mut exit_reason = "max_iterations".to_string();
    let mut iteration = 0u32;
    while iteration < max_iterations {
        iteration += 1;
        let (should_continue, spec_complete) = machine.run_iteration(iteration).await;

        if let Some(result) = machine.last_stage_result.take() {
            let reconciled = machine.last_reconcile_result.take().unwrap_or_default();
            let record = IterationRecord {
                run_id: run_id.clone(),
                iteration,
                stage: result.stage.to_string(),
                model: config.model.clone(),
                is_local: config.model.is_empty(),
                task_id: result.task_id.clone().unwrap_or_default(),
                cost: result.cost,
                tokens: TokenBreakdown {
                    input: 0,
                    cached: 0,
                    output: result.tokens_used,
                },
                duration_s: result.duration_seconds,
                outcome: format!("{:?}", result.outcome).to_uppercase(),
                precheck_accepted: false,
                validation_retries: 0,
                kill_reason: result.kill_reason.clone(),
                tasks_added: reconciled.tasks_added.len() as u32,
                tasks_accepted: reconciled.tasks_accepted.len() as u32,
                tasks_rejected: reconciled.tasks_rejected.len() as u32,
                issues_added: reconciled.issues_added.len() as u32,
            };
            if let Err(e) = ledger::write_iteration(&paths.log_dir, &record) {
                warn!(error = %e, "failed to write iteration record");
            }
        }

        if let Some(pending) = pending_for_escalation(ticket_store.as_ref()).await {
            machine.escalate_stuck_tasks(&pending).await;
        }

        if spec_complete {
            exit_reason = "spec_complete".to_string();
            break;
        }
        if let Some(reason) = machine.check_budgets() {
            exit_reason = reason.as_str().to_string();
            break;
        }
        if !should_continue {
            exit_reason = "no_active_spec".to_string();
            break;
        }
        info!(iteration, metrics = ?machine.metrics, "construct iteration complete");
    }

    let git_sha_end = ralph_core::git::current_commit(repo_root).await;
    let ended_at = chrono::Utc::now();

    let record = RunRecord {
        run_id,
        spec: active_spec,
        branch,
        git_sha_start,
        git_sha_end,
        worktree: repo_root.display().to_string(),
        profile: config.profile.clone(),
        started_at: started_at.to_rfc3339(),
        ended_at: ended_at.to_rfc3339(),
        duration_s: (ended_at - started_at).num_milliseconds() as f64 / 1000.0,
        exit_reason,
        iterations: machine.metrics.total_iterations,
        tasks_total: machine.metrics.successes + machine.metrics.failures,
        tasks_completed: machine.metrics.tasks_completed,
        tasks_failed: machine.metrics.failures,
        cost: machine.metrics.total_cost,
        tokens: TokenBreakdown {
            input: machine.metrics.total_tokens_in,
            cached: machine.metrics.total_tokens_cached,
            output: machine.metrics.total_tokens_out,
        },
        api_calls_remote: machine.metrics.api_calls_remote,
        api_calls_local: machine.metrics.api_calls_local,
        kills_timeout: machine.metrics.kills_timeout,
        kills_context: machine.metrics.kills_context,
        kills_loop: machine.metrics.kills_loop,
        retries_validation: machine.metrics.validation_retries,
        retries_task: 0,
        stages: Default::default(),
    };

    ledger::write_run(&paths.log_dir, &record).context("failed to write run record")?;

    println!(
        "construct finished: {} iterations, exit={}, cost=${:.2}",
        record.iterations, record.exit_reason, record.cost
    );
    Ok(())
}

async fn pending_for_escalation(store: &dyn TicketStore) -> Option<Vec<ralph_core::Task>> {
    store.list_pending().await.ok()
}
