//! Stage runner primitives: the common shape each construct stage shares
//! (prompt composition, outcome classification, result type), shared by
//! the dispatch logic in [`crate::construct`].

pub mod prompt;

use crate::orch_state::Stage;

/// How a single stage invocation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure,
    Skip,
}

/// The result of running one stage once.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub cost: f64,
    pub tokens_used: u64,
    pub kill_reason: Option<String>,
    pub kill_log: Option<String>,
    pub task_id: Option<String>,
    pub error: Option<String>,
}

impl StageResult {
    pub fn skip(stage: Stage) -> Self {
        StageResult {
            stage,
            outcome: StageOutcome::Skip,
            exit_code: 0,
            duration_seconds: 0.0,
            cost: 0.0,
            tokens_used: 0,
            kill_reason: None,
            kill_log: None,
            task_id: None,
            error: None,
        }
    }
}

/// Map a stage to its prompt template filename.
pub fn prompt_filename(stage: Stage) -> &'static str {
    match stage {
        Stage::Plan => "PROMPT_PLAN.md",
        Stage::Investigate => "PROMPT_INVESTIGATE.md",
        Stage::Build => "PROMPT_BUILD.md",
        Stage::Verify => "PROMPT_VERIFY.md",
        Stage::Decompose => "PROMPT_DECOMPOSE.md",
        Stage::Complete => "PROMPT_PLAN.md",
    }
}

/// Outcome assignment per the documented rule: SUCCESS requires a clean
/// exit, no timeout, and structured output that actually mutated
/// something; anything else that ran is a FAILURE.
pub fn classify_outcome(exit_code: i32, timed_out: bool, had_structured_output: bool, made_progress: bool) -> StageOutcome {
    if timed_out {
        return StageOutcome::Failure;
    }
    if exit_code != 0 {
        return StageOutcome::Failure;
    }
    if !had_structured_output || !made_progress {
        return StageOutcome::Failure;
    }
    StageOutcome::Success
}

/// Truncate a kill log for prompt embedding: at most `head` lines from the
/// start and `tail` lines from the end, joined with an elision marker. The
/// full log is never embedded — only used for DECOMPOSE context today, but
/// generically useful anywhere a prior failure's log needs summarizing.
pub fn truncate_kill_log(log: &str, head: usize, tail: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    if lines.len() <= head + tail {
        return log.to_string();
    }
    let head_lines = &lines[..head];
    let tail_lines = &lines[lines.len() - tail..];
    format!(
        "{}\n... ({} lines omitted) ...\n{}",
        head_lines.join("\n"),
        lines.len() - head - tail,
        tail_lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_outcome_success_requires_clean_exit_and_progress() {
        assert_eq!(
            classify_outcome(0, false, true, true),
            StageOutcome::Success
        );
    }

    #[test]
    fn classify_outcome_failure_on_timeout_even_with_progress() {
        assert_eq!(classify_outcome(0, true, true, true), StageOutcome::Failure);
    }

    #[test]
    fn classify_outcome_failure_on_nonzero_exit() {
        assert_eq!(classify_outcome(1, false, true, true), StageOutcome::Failure);
    }

    #[test]
    fn classify_outcome_failure_when_nothing_mutated() {
        assert_eq!(
            classify_outcome(0, false, true, false),
            StageOutcome::Failure
        );
    }

    #[test]
    fn truncate_kill_log_leaves_short_logs_untouched() {
        let log = "line1\nline2\nline3";
        assert_eq!(truncate_kill_log(log, 50, 100), log);
    }

    #[test]
    fn truncate_kill_log_keeps_head_and_tail_of_long_logs() {
        let lines: Vec<String> = (0..200).map(|i| format!("line{i}")).collect();
        let log = lines.join("\n");
        let truncated = truncate_kill_log(&log, 50, 100);
        assert!(truncated.starts_with("line0"));
        assert!(truncated.ends_with("line199"));
        assert!(truncated.contains("omitted"));
    }

    #[test]
    fn prompt_filename_maps_every_stage() {
        assert_eq!(prompt_filename(Stage::Build), "PROMPT_BUILD.md");
        assert_eq!(prompt_filename(Stage::Decompose), "PROMPT_DECOMPOSE.md");
    }
}
