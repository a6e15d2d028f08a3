//! In-memory run metrics and loop detection. Neither is persisted to the
//! plan file or orchestration state; both reset when the process restarts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use crate::stages::{StageOutcome, StageResult};

/// Running totals for the current construct process.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub total_cost: f64,
    pub total_iterations: u32,
    pub total_tokens_in: u64,
    pub total_tokens_cached: u64,
    pub total_tokens_out: u64,
    pub failures: u32,
    pub successes: u32,
    pub kills_timeout: u32,
    pub kills_context: u32,
    pub kills_loop: u32,
    pub last_kill_reason: Option<String>,
    last_progress_time: Option<Instant>,
    pub tasks_completed: u32,
    pub commits_made: u32,
    pub api_calls_remote: u32,
    pub api_calls_local: u32,
    pub validation_retries: u32,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            total_cost: 0.0,
            total_iterations: 0,
            total_tokens_in: 0,
            total_tokens_cached: 0,
            total_tokens_out: 0,
            failures: 0,
            successes: 0,
            kills_timeout: 0,
            kills_context: 0,
            kills_loop: 0,
            last_kill_reason: None,
            last_progress_time: None,
            tasks_completed: 0,
            commits_made: 0,
            api_calls_remote: 0,
            api_calls_local: 0,
            validation_retries: 0,
        }
    }
}

impl Metrics {
    pub fn tokens_used(&self) -> u64 {
        self.total_tokens_in + self.total_tokens_cached + self.total_tokens_out
    }

    pub fn record_progress(&mut self) {
        self.last_progress_time = Some(Instant::now());
    }

    pub fn seconds_since_progress(&self) -> Option<f64> {
        self.last_progress_time.map(|t| t.elapsed().as_secs_f64())
    }

    /// Fold a stage result's cost/outcome into the running totals. Token
    /// breakdown is recorded separately via [`Metrics::record_tokens`],
    /// since `StageResult` only carries the combined total. A remote call
    /// is assumed unless the caller marks it local.
    pub fn record_stage_result(&mut self, result: &StageResult, is_local: bool) {
        self.total_cost += result.cost;
        self.total_iterations += 1;
        match result.outcome {
            StageOutcome::Success => self.successes += 1,
            StageOutcome::Failure => {
                self.failures += 1;
                self.last_kill_reason = result.kill_reason.clone();
            }
            StageOutcome::Skip => {}
        }
        if is_local {
            self.api_calls_local += 1;
        } else {
            self.api_calls_remote += 1;
        }
    }

    pub fn record_tokens(&mut self, tokens_in: u64, tokens_cached: u64, tokens_out: u64) {
        self.total_tokens_in += tokens_in;
        self.total_tokens_cached += tokens_cached;
        self.total_tokens_out += tokens_out;
    }

    pub fn record_kill(&mut self, reason: &str) {
        self.last_kill_reason = Some(reason.to_string());
        match reason {
            "timeout" => self.kills_timeout += 1,
            "context_limit" => self.kills_context += 1,
            "loop_detected" => self.kills_loop += 1,
            _ => {}
        }
    }
}

/// Detects a stuck run: the same fingerprint repeating too many times in a
/// row. Fingerprints are an opaque hash, not the raw text, to keep memory
/// bounded over a long run.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    threshold: usize,
    last_hash: Option<u64>,
    consecutive_identical: usize,
    history_len: usize,
}

impl LoopDetector {
    pub fn new(threshold: usize) -> Self {
        LoopDetector {
            threshold,
            last_hash: None,
            consecutive_identical: 0,
            history_len: 0,
        }
    }

    fn hash(output: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        output.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns true once the same fingerprint has repeated `threshold`
    /// times in a row.
    pub fn check_output(&mut self, output: &str) -> bool {
        let hash = Self::hash(output);
        self.history_len += 1;
        if Some(hash) == self.last_hash {
            self.consecutive_identical += 1;
        } else {
            self.consecutive_identical = 1;
            self.last_hash = Some(hash);
        }
        self.consecutive_identical >= self.threshold
    }

    pub fn reset(&mut self) {
        self.last_hash = None;
        self.consecutive_identical = 0;
        self.history_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_result(outcome: StageOutcome) -> StageResult {
        StageResult {
            stage: crate::orch_state::Stage::Build,
            outcome,
            exit_code: 0,
            duration_seconds: 1.0,
            cost: 0.5,
            tokens_used: 100,
            kill_reason: None,
            kill_log: None,
            task_id: None,
            error: None,
        }
    }

    #[test]
    fn record_stage_result_accumulates_cost_and_counts() {
        let mut metrics = Metrics::default();
        metrics.record_stage_result(&dummy_result(StageOutcome::Success), false);
        metrics.record_stage_result(&dummy_result(StageOutcome::Failure), true);
        assert_eq!(metrics.total_cost, 1.0);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.api_calls_remote, 1);
        assert_eq!(metrics.api_calls_local, 1);
    }

    #[test]
    fn seconds_since_progress_is_none_until_recorded() {
        let metrics = Metrics::default();
        assert!(metrics.seconds_since_progress().is_none());
    }

    #[test]
    fn seconds_since_progress_is_small_right_after_recording() {
        let mut metrics = Metrics::default();
        metrics.record_progress();
        assert!(metrics.seconds_since_progress().unwrap() < 1.0);
    }

    #[test]
    fn loop_detector_triggers_after_threshold_identical_outputs() {
        let mut detector = LoopDetector::new(3);
        assert!(!detector.check_output("same"));
        assert!(!detector.check_output("same"));
        assert!(detector.check_output("same"));
    }

    #[test]
    fn loop_detector_resets_on_different_output() {
        let mut detector = LoopDetector::new(3);
        detector.check_output("same");
        detector.check_output("same");
        assert!(!detector.check_output("different"));
    }

    #[test]
    fn loop_detector_reset_clears_state() {
        let mut detector = LoopDetector::new(2);
        detector.check_output("x");
        detector.reset();
        assert!(!detector.check_output("x"));
    }
}
