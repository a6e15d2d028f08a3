//! Plan data model: tasks, issues, tombstones, and per-plan configuration.
//!
//! These are the value types that flow across the ticket-store boundary.
//! They mirror the line-delimited record format in [`crate::plan_file`]:
//! each type knows how to round-trip through the short, sparse JSON shape
//! that the plan file actually stores (`s` for status, `decompose` for the
//! needs-decompose flag, and so on) rather than a field-for-field dump.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Priority rank used for scheduling order. `Unset` sorts with `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {}", self.0)
    }
}
impl std::error::Error for PriorityParseError {}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(PriorityParseError(other.to_string())),
        }
    }
}

impl Priority {
    /// Ascending sort rank: lower sorts first. Missing priority behaves as `Medium`.
    pub fn rank(this: Option<Priority>) -> u8 {
        match this {
            Some(Priority::High) => 0,
            Some(Priority::Medium) | None => 1,
            Some(Priority::Low) => 2,
        }
    }
}

/// Task status. Only two states are persisted; "accepted" is represented
/// structurally via accept-tombstones, not as a third status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Done,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// A unit of implementation work with an acceptance criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<Vec<String>>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<String>,
    #[serde(default)]
    pub needs_decompose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(default)]
    pub decompose_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, spec: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            name: name.into(),
            spec: spec.into(),
            notes: None,
            accept: None,
            deps: None,
            status: TaskStatus::Pending,
            done_at: None,
            needs_decompose: false,
            kill_reason: None,
            kill_log: None,
            priority: None,
            reject_reason: None,
            parent: None,
            created_from: None,
            supersedes: None,
            decompose_depth: 0,
            timeout_ms: None,
        }
    }

    /// A task that has been killed is never reported as done; setting one
    /// clears the other, matching the mutual-exclusion invariant in the data
    /// model (a completed task cannot also carry an unresolved failure).
    pub fn set_kill_reason(&mut self, reason: impl Into<String>, log: Option<String>) {
        self.kill_reason = Some(reason.into());
        self.kill_log = log;
        if self.status == TaskStatus::Done {
            self.status = TaskStatus::Pending;
            self.done_at = None;
        }
    }

    pub fn mark_done(&mut self, done_at: impl Into<String>) {
        self.status = TaskStatus::Done;
        self.done_at = Some(done_at.into());
        self.kill_reason = None;
        self.kill_log = None;
    }

    pub fn deps_satisfied(&self, completed_ids: &std::collections::HashSet<String>) -> bool {
        match &self.deps {
            None => true,
            Some(deps) => deps.iter().all(|d| completed_ids.contains(d)),
        }
    }
}

/// An unresolved observation that INVESTIGATE turns into tasks (or dismisses).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub desc: String,
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl Issue {
    pub fn new(id: impl Into<String>, desc: impl Into<String>, spec: impl Into<String>) -> Self {
        Issue {
            id: id.into(),
            desc: desc.into(),
            spec: spec.into(),
            priority: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TombstoneKind {
    Accept,
    Reject,
}

/// An immutable record of a task's resolution. Append-only: once written,
/// a tombstone is never rewritten or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub done_at: String,
    pub reason: String,
    pub kind: TombstoneKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Legacy forward-compat field: accepted on read, never emitted on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Tombstone {
    pub fn accept(id: impl Into<String>, done_at: impl Into<String>, reason: impl Into<String>) -> Self {
        Tombstone {
            id: id.into(),
            done_at: done_at.into(),
            reason: reason.into(),
            kind: TombstoneKind::Accept,
            name: String::new(),
            timestamp: None,
            changed_files: None,
            log_file: None,
            iteration: None,
            notes: None,
        }
    }

    pub fn reject(id: impl Into<String>, done_at: impl Into<String>, reason: impl Into<String>) -> Self {
        Tombstone {
            id: id.into(),
            done_at: done_at.into(),
            reason: reason.into(),
            kind: TombstoneKind::Reject,
            name: String::new(),
            timestamp: None,
            changed_files: None,
            log_file: None,
            iteration: None,
            notes: None,
        }
    }
}

/// Per-plan overrides, stored as the `config` record at the head of the plan file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub timeout_ms: u64,
    pub max_iterations: u32,
    pub context_warn: f64,
    pub context_compact: f64,
    pub context_kill: f64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        PlanConfig {
            timeout_ms: 900_000,
            max_iterations: 10,
            context_warn: 0.70,
            context_compact: 0.85,
            context_kill: 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_roundtrips_through_display_and_fromstr() {
        for p in [Priority::High, Priority::Medium, Priority::Low] {
            let s = p.to_string();
            assert_eq!(s.parse::<Priority>().unwrap(), p);
        }
    }

    #[test]
    fn priority_rejects_invalid_string() {
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_rank_treats_missing_as_medium() {
        assert_eq!(Priority::rank(None), Priority::rank(Some(Priority::Medium)));
        assert!(Priority::rank(Some(Priority::High)) < Priority::rank(None));
        assert!(Priority::rank(None) < Priority::rank(Some(Priority::Low)));
    }

    #[test]
    fn set_kill_reason_clears_done_status() {
        let mut t = Task::new("t-1", "do thing", "s.md");
        t.mark_done("2024-01-01T00:00:00Z");
        assert_eq!(t.status, TaskStatus::Done);

        t.set_kill_reason("timeout", Some("/tmp/log".into()));
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.done_at.is_none());
        assert_eq!(t.kill_reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn deps_satisfied_true_when_no_deps() {
        let t = Task::new("t-1", "n", "s.md");
        assert!(t.deps_satisfied(&Default::default()));
    }

    #[test]
    fn deps_satisfied_requires_all_present() {
        let mut t = Task::new("t-1", "n", "s.md");
        t.deps = Some(vec!["t-a".into(), "t-b".into()]);
        let mut done: std::collections::HashSet<String> = Default::default();
        done.insert("t-a".into());
        assert!(!t.deps_satisfied(&done));
        done.insert("t-b".into());
        assert!(t.deps_satisfied(&done));
    }

    #[test]
    fn plan_config_defaults_match_fifteen_minute_timeout() {
        let cfg = PlanConfig::default();
        assert_eq!(cfg.timeout_ms, 900_000);
        assert_eq!(cfg.max_iterations, 10);
    }
}
