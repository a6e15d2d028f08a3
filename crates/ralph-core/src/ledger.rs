//! Append-only run/iteration ledger: two line-delimited JSON files per
//! repo+branch+spec log directory. Records are never rewritten; readers
//! tolerate missing files and malformed lines.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::BASE36;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub input: u64,
    pub cached: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageBreakdown {
    pub count: u32,
    pub cost: f64,
    pub api_calls_remote: u32,
    pub api_calls_local: u32,
}

/// One row per construct iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub run_id: String,
    pub iteration: u32,
    pub stage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: TokenBreakdown,
    pub duration_s: f64,
    pub outcome: String,
    #[serde(default)]
    pub precheck_accepted: bool,
    #[serde(default)]
    pub validation_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
    #[serde(default)]
    pub tasks_added: u32,
    #[serde(default)]
    pub tasks_accepted: u32,
    #[serde(default)]
    pub tasks_rejected: u32,
    #[serde(default)]
    pub issues_added: u32,
}

impl IterationRecord {
    /// Sparse wire shape: reconciliation counts are nested under `reconcile`
    /// and omitted entirely when all are zero.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("run_id".into(), json!(self.run_id));
        obj.insert("iteration".into(), json!(self.iteration));
        obj.insert("stage".into(), json!(self.stage));
        if !self.model.is_empty() {
            obj.insert("model".into(), json!(self.model));
        }
        if self.is_local {
            obj.insert("is_local".into(), json!(true));
        }
        if !self.task_id.is_empty() {
            obj.insert("task_id".into(), json!(self.task_id));
        }
        if self.cost != 0.0 {
            obj.insert("cost".into(), json!(self.cost));
        }
        obj.insert("tokens".into(), json!(self.tokens));
        obj.insert("duration_s".into(), json!(self.duration_s));
        obj.insert("outcome".into(), json!(self.outcome));
        if self.precheck_accepted {
            obj.insert("precheck_accepted".into(), json!(true));
        }
        if self.validation_retries > 0 {
            obj.insert("validation_retries".into(), json!(self.validation_retries));
        }
        if let Some(k) = &self.kill_reason {
            obj.insert("kill_reason".into(), json!(k));
        }
        let reconcile_nonzero = self.tasks_added > 0
            || self.tasks_accepted > 0
            || self.tasks_rejected > 0
            || self.issues_added > 0;
        if reconcile_nonzero {
            obj.insert(
                "reconcile".into(),
                json!({
                    "tasks_added": self.tasks_added,
                    "tasks_accepted": self.tasks_accepted,
                    "tasks_rejected": self.tasks_rejected,
                    "issues_added": self.issues_added,
                }),
            );
        }
        Value::Object(obj)
    }
}

/// One row per `construct` invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default)]
    pub spec: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub git_sha_start: String,
    #[serde(default)]
    pub git_sha_end: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default = "default_profile_name")]
    pub profile: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub ended_at: String,
    #[serde(default)]
    pub duration_s: f64,
    #[serde(default)]
    pub exit_reason: String,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub tasks_total: u32,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: TokenBreakdown,
    #[serde(default)]
    pub api_calls_remote: u32,
    #[serde(default)]
    pub api_calls_local: u32,
    #[serde(default)]
    pub kills_timeout: u32,
    #[serde(default)]
    pub kills_context: u32,
    #[serde(default)]
    pub kills_loop: u32,
    #[serde(default)]
    pub retries_validation: u32,
    #[serde(default)]
    pub retries_task: u32,
    #[serde(default)]
    pub stages: std::collections::HashMap<String, StageBreakdown>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl RunRecord {
    pub fn to_value(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "spec": self.spec,
            "branch": self.branch,
            "git_sha_start": self.git_sha_start,
            "git_sha_end": self.git_sha_end,
            "worktree": self.worktree,
            "profile": self.profile,
            "started_at": self.started_at,
            "ended_at": self.ended_at,
            "duration_s": self.duration_s,
            "exit_reason": self.exit_reason,
            "iterations": self.iterations,
            "tasks": {
                "total": self.tasks_total,
                "completed": self.tasks_completed,
                "failed": self.tasks_failed,
            },
            "cost": self.cost,
            "tokens": self.tokens,
            "api_calls": {
                "remote": self.api_calls_remote,
                "local": self.api_calls_local,
            },
            "kills": {
                "timeout": self.kills_timeout,
                "context": self.kills_context,
                "loop": self.kills_loop,
            },
            "retries": {
                "validation": self.retries_validation,
                "task": self.retries_task,
            },
            "stages": self.stages,
        })
    }
}

/// Timestamp (caller-supplied, since this crate never calls `SystemTime`
/// internally for anything but IDs) plus a short random suffix.
pub fn generate_run_id(timestamp: &str, rand_suffix_source: u32) -> String {
    let mut n = rand_suffix_source;
    let mut suffix = [0u8; 6];
    for slot in suffix.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    format!("{timestamp}_{}", std::str::from_utf8(&suffix).unwrap())
}

/// Convenience wrapper that seeds the random suffix from the OS RNG.
pub fn new_run_id(timestamp: &str) -> String {
    generate_run_id(timestamp, rand::rng().random())
}

fn append_jsonl(path: &Path, value: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{value}")?;
    Ok(())
}

pub fn write_iteration(log_dir: &Path, record: &IterationRecord) -> std::io::Result<()> {
    append_jsonl(&log_dir.join("iterations.jsonl"), &record.to_value())
}

pub fn write_run(log_dir: &Path, record: &RunRecord) -> std::io::Result<()> {
    append_jsonl(&log_dir.join("runs.jsonl"), &record.to_value())
}

fn load_lines(path: &Path) -> Vec<Value> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

pub fn load_runs(log_dir: &Path) -> Vec<Value> {
    load_lines(&log_dir.join("runs.jsonl"))
}

pub fn load_iterations(log_dir: &Path, run_id: Option<&str>) -> Vec<Value> {
    let all = load_lines(&log_dir.join("iterations.jsonl"));
    match run_id {
        Some(id) => all
            .into_iter()
            .filter(|v| v.get("run_id").and_then(|r| r.as_str()) == Some(id))
            .collect(),
        None => all,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_run_id_has_expected_shape() {
        let id = generate_run_id("20240101_000000", 123456);
        assert!(id.starts_with("20240101_000000_"));
        assert_eq!(id.len(), "20240101_000000_".len() + 6);
    }

    #[test]
    fn iteration_record_omits_zero_reconcile_counts() {
        let record = IterationRecord {
            run_id: "r1".into(),
            iteration: 1,
            stage: "BUILD".into(),
            model: String::new(),
            is_local: false,
            task_id: "t-1".into(),
            cost: 0.0,
            tokens: TokenBreakdown::default(),
            duration_s: 1.0,
            outcome: "SUCCESS".into(),
            precheck_accepted: false,
            validation_retries: 0,
            kill_reason: None,
            tasks_added: 0,
            tasks_accepted: 0,
            tasks_rejected: 0,
            issues_added: 0,
        };
        let value = record.to_value();
        assert!(value.as_object().unwrap().get("reconcile").is_none());
    }

    #[test]
    fn iteration_record_nests_nonzero_reconcile_counts() {
        let mut record = IterationRecord {
            run_id: "r1".into(),
            iteration: 1,
            stage: "VERIFY".into(),
            model: String::new(),
            is_local: false,
            task_id: String::new(),
            cost: 0.0,
            tokens: TokenBreakdown::default(),
            duration_s: 1.0,
            outcome: "SUCCESS".into(),
            precheck_accepted: false,
            validation_retries: 0,
            kill_reason: None,
            tasks_added: 0,
            tasks_accepted: 2,
            tasks_rejected: 0,
            issues_added: 0,
        };
        record.tasks_accepted = 2;
        let value = record.to_value();
        assert_eq!(value["reconcile"]["tasks_accepted"], 2);
    }

    #[test]
    fn write_then_load_runs_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let record = RunRecord {
            run_id: "r1".into(),
            spec: "s.md".into(),
            ..Default::default()
        };
        write_run(dir.path(), &record).unwrap();
        let loaded = load_runs(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0]["run_id"], "r1");
    }

    #[test]
    fn load_iterations_filters_by_run_id() {
        let dir = tempfile::tempdir().unwrap();
        for (run_id, iteration) in [("r1", 1), ("r2", 1), ("r1", 2)] {
            let record = IterationRecord {
                run_id: run_id.into(),
                iteration,
                stage: "BUILD".into(),
                model: String::new(),
                is_local: false,
                task_id: String::new(),
                cost: 0.0,
                tokens: TokenBreakdown::default(),
                duration_s: 0.0,
                outcome: "SUCCESS".into(),
                precheck_accepted: false,
                validation_retries: 0,
                kill_reason: None,
                tasks_added: 0,
                tasks_accepted: 0,
                tasks_rejected: 0,
                issues_added: 0,
            };
            write_iteration(dir.path(), &record).unwrap();
        }
        let filtered = load_iterations(dir.path(), Some("r1"));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn load_runs_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_runs(dir.path()).is_empty());
    }
}
