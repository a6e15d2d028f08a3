//! Line-delimited plan record format: the on-disk shape of `plan.jsonl`.
//!
//! Each line is a self-describing JSON object tagged by a `t` field. The
//! wire shape is deliberately terser than the in-memory [`crate::model`]
//! types (`s` for status, `decompose` for the needs-decompose flag, and so
//! on) to match the format the ticket-store CLI reads and writes. This
//! module owns the dict-shaped conversion in both directions plus the
//! whole-file atomic read/write.
//!
//! Two consumers: the orchestrator bootstraps a plan file directly here
//! (`ralph plan`/`ralph init`, before any tasks exist to hand off to the
//! ticket store), and reporting commands (`ralph log`, `ralph compare`)
//! read tombstones back out for rejection-pattern analysis. Live mutation
//! during a construct run goes through [`crate::ticket_store`] instead.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::model::{Issue, PlanConfig, Priority, Task, TaskStatus, Tombstone, TombstoneKind};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record missing required field `{0}`")]
    MissingField(&'static str),
    #[error("record field `{field}` has unexpected type")]
    WrongType { field: &'static str },
    #[error("unknown record type `{0}`")]
    UnknownType(String),
}

fn get_str(m: &Map<String, Value>, key: &'static str) -> Option<String> {
    m.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn require_str(m: &Map<String, Value>, key: &'static str) -> Result<String, RecordError> {
    get_str(m, key).ok_or(RecordError::MissingField(key))
}

fn get_priority(m: &Map<String, Value>) -> Option<Priority> {
    get_str(m, "priority").and_then(|s| s.parse().ok())
}

fn get_str_list(m: &Map<String, Value>, key: &'static str) -> Option<Vec<String>> {
    m.get(key)?.as_array().map(|a| {
        a.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

// ---------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------

pub fn task_to_record(task: &Task) -> Value {
    let mut m = Map::new();
    m.insert("t".into(), json!("task"));
    m.insert("id".into(), json!(task.id));
    m.insert("name".into(), json!(task.name));
    m.insert("spec".into(), json!(task.spec));
    if let Some(notes) = &task.notes {
        m.insert("notes".into(), json!(notes));
    }
    if let Some(accept) = &task.accept {
        m.insert("accept".into(), json!(accept));
    }
    if let Some(deps) = &task.deps {
        if !deps.is_empty() {
            m.insert("deps".into(), json!(deps));
        }
    }
    m.insert(
        "s".into(),
        json!(match task.status {
            TaskStatus::Pending => "p",
            TaskStatus::Done => "d",
        }),
    );
    if let Some(done_at) = &task.done_at {
        m.insert("done_at".into(), json!(done_at));
    }
    if task.needs_decompose {
        m.insert("decompose".into(), json!(true));
    }
    if let Some(kill) = &task.kill_reason {
        m.insert("kill".into(), json!(kill));
    }
    if let Some(kill_log) = &task.kill_log {
        m.insert("kill_log".into(), json!(kill_log));
    }
    if let Some(p) = task.priority {
        m.insert("priority".into(), json!(p.to_string()));
    }
    if let Some(r) = &task.reject_reason {
        m.insert("reject".into(), json!(r));
    }
    if let Some(parent) = &task.parent {
        m.insert("parent".into(), json!(parent));
    }
    if let Some(cf) = &task.created_from {
        m.insert("created_from".into(), json!(cf));
    }
    if let Some(s) = &task.supersedes {
        m.insert("supersedes".into(), json!(s));
    }
    if task.decompose_depth != 0 {
        m.insert("decompose_depth".into(), json!(task.decompose_depth));
    }
    if let Some(t) = task.timeout_ms {
        m.insert("timeout_ms".into(), json!(t));
    }
    Value::Object(m)
}

pub fn task_from_record(m: &Map<String, Value>) -> Result<Task, RecordError> {
    // Back-compat: an older writer used `desc` where the current one uses `name`.
    let name = get_str(m, "name")
        .or_else(|| get_str(m, "desc"))
        .unwrap_or_default();
    let status = match m.get("s").and_then(|v| v.as_str()) {
        Some("d") => TaskStatus::Done,
        _ => TaskStatus::Pending,
    };
    Ok(Task {
        id: require_str(m, "id")?,
        name,
        spec: get_str(m, "spec").unwrap_or_default(),
        notes: get_str(m, "notes"),
        accept: get_str(m, "accept"),
        deps: get_str_list(m, "deps"),
        status,
        done_at: get_str(m, "done_at"),
        needs_decompose: m.get("decompose").and_then(|v| v.as_bool()).unwrap_or(false),
        kill_reason: get_str(m, "kill"),
        kill_log: get_str(m, "kill_log"),
        priority: get_priority(m),
        reject_reason: get_str(m, "reject"),
        parent: get_str(m, "parent"),
        created_from: get_str(m, "created_from"),
        supersedes: get_str(m, "supersedes"),
        decompose_depth: m
            .get("decompose_depth")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        timeout_ms: m.get("timeout_ms").and_then(|v| v.as_u64()),
    })
}

// ---------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------

pub fn issue_to_record(issue: &Issue) -> Value {
    let mut m = Map::new();
    m.insert("t".into(), json!("issue"));
    m.insert("id".into(), json!(issue.id));
    m.insert("desc".into(), json!(issue.desc));
    m.insert("spec".into(), json!(issue.spec));
    if let Some(p) = issue.priority {
        m.insert("priority".into(), json!(p.to_string()));
    }
    Value::Object(m)
}

pub fn issue_from_record(m: &Map<String, Value>) -> Result<Issue, RecordError> {
    Ok(Issue {
        id: require_str(m, "id")?,
        desc: get_str(m, "desc").unwrap_or_default(),
        spec: get_str(m, "spec").unwrap_or_default(),
        priority: get_priority(m),
    })
}

// ---------------------------------------------------------------------
// Tombstone
// ---------------------------------------------------------------------

pub fn tombstone_to_record(tomb: &Tombstone) -> Value {
    let mut m = Map::new();
    m.insert(
        "t".into(),
        json!(match tomb.kind {
            TombstoneKind::Accept => "accept",
            TombstoneKind::Reject => "reject",
        }),
    );
    m.insert("id".into(), json!(tomb.id));
    m.insert("done_at".into(), json!(tomb.done_at));
    m.insert("reason".into(), json!(tomb.reason));
    if !tomb.name.is_empty() {
        m.insert("name".into(), json!(tomb.name));
    }
    // Legacy field: never emitted by this writer, only accepted on read.
    if let Some(cf) = &tomb.changed_files {
        m.insert("changed_files".into(), json!(cf));
    }
    if let Some(lf) = &tomb.log_file {
        m.insert("log_file".into(), json!(lf));
    }
    if let Some(it) = tomb.iteration {
        m.insert("iteration".into(), json!(it));
    }
    if let Some(n) = &tomb.notes {
        m.insert("notes".into(), json!(n));
    }
    Value::Object(m)
}

pub fn tombstone_from_record(m: &Map<String, Value>, kind: TombstoneKind) -> Result<Tombstone, RecordError> {
    Ok(Tombstone {
        id: require_str(m, "id")?,
        done_at: get_str(m, "done_at").unwrap_or_default(),
        reason: get_str(m, "reason").unwrap_or_default(),
        kind,
        name: get_str(m, "name").unwrap_or_default(),
        timestamp: get_str(m, "timestamp"),
        changed_files: get_str_list(m, "changed_files"),
        log_file: get_str(m, "log_file"),
        iteration: m.get("iteration").and_then(|v| v.as_u64()),
        notes: get_str(m, "notes"),
    })
}

// ---------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------

pub fn config_to_record(cfg: &PlanConfig) -> Value {
    json!({
        "t": "config",
        "timeout_ms": cfg.timeout_ms,
        "max_iterations": cfg.max_iterations,
        "context_warn": cfg.context_warn,
        "context_compact": cfg.context_compact,
        "context_kill": cfg.context_kill,
    })
}

pub fn config_from_record(m: &Map<String, Value>) -> PlanConfig {
    let d = PlanConfig::default();
    PlanConfig {
        timeout_ms: m.get("timeout_ms").and_then(|v| v.as_u64()).unwrap_or(d.timeout_ms),
        max_iterations: m
            .get("max_iterations")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(d.max_iterations),
        context_warn: m.get("context_warn").and_then(|v| v.as_f64()).unwrap_or(d.context_warn),
        context_compact: m
            .get("context_compact")
            .and_then(|v| v.as_f64())
            .unwrap_or(d.context_compact),
        context_kill: m.get("context_kill").and_then(|v| v.as_f64()).unwrap_or(d.context_kill),
    }
}

// ---------------------------------------------------------------------
// Whole-file aggregate
// ---------------------------------------------------------------------

/// A fully loaded plan file: config, the active spec, live tasks/issues, and
/// the append-only tombstone history.
#[derive(Debug, Clone, Default)]
pub struct PlanFile {
    pub config: PlanConfig,
    pub spec: Option<String>,
    pub tasks: Vec<Task>,
    pub issues: Vec<Issue>,
    pub accepted: Vec<Tombstone>,
    pub rejected: Vec<Tombstone>,
}

impl PlanFile {
    pub fn pending(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Pending)
    }

    pub fn done(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Done)
    }

    /// IDs considered resolved for dependency-satisfaction purposes: done
    /// tasks plus anything already tombstoned as accepted.
    pub fn completed_ids(&self) -> std::collections::HashSet<String> {
        let mut ids: std::collections::HashSet<String> =
            self.done().map(|t| t.id.clone()).collect();
        ids.extend(self.accepted.iter().map(|t| t.id.clone()));
        ids
    }
}

/// Read a plan file from disk. A missing file is equivalent to empty state.
/// Malformed lines are skipped individually; this does not abort the whole
/// read, and does not surface an error to the caller.
pub fn load(path: &Path) -> PlanFile {
    let mut plan = PlanFile::default();
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return plan,
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let obj = match value.as_object() {
            Some(o) => o,
            None => continue,
        };
        let t = match obj.get("t").and_then(|v| v.as_str()) {
            Some(t) => t,
            None => continue,
        };

        let dispatched = match t {
            "config" => {
                plan.config = config_from_record(obj);
                true
            }
            "spec" => {
                if let Some(s) = get_str(obj, "file").or_else(|| get_str(obj, "spec")) {
                    plan.spec = Some(s);
                }
                true
            }
            "task" => task_from_record(obj).map(|task| plan.tasks.push(task)).is_ok(),
            "issue" => issue_from_record(obj).map(|issue| plan.issues.push(issue)).is_ok(),
            "accept" => tombstone_from_record(obj, TombstoneKind::Accept)
                .map(|tomb| plan.accepted.push(tomb))
                .is_ok(),
            "reject" => tombstone_from_record(obj, TombstoneKind::Reject)
                .map(|tomb| plan.rejected.push(tomb))
                .is_ok(),
            _ => false,
        };
        // A line that fails to parse into its declared type is treated the
        // same as any other malformed line: skipped, not fatal.
        let _ = dispatched;
    }

    plan
}

/// Write the plan file atomically (write to a sibling temp file, then
/// rename). Record order is normative: config, spec, tasks, issues,
/// accept-tombstones, reject-tombstones.
pub fn save(path: &Path, plan: &PlanFile) -> std::io::Result<()> {
    let mut lines = Vec::with_capacity(
        2 + plan.tasks.len() + plan.issues.len() + plan.accepted.len() + plan.rejected.len(),
    );

    lines.push(config_to_record(&plan.config).to_string());
    if let Some(spec) = &plan.spec {
        lines.push(json!({"t": "spec", "file": spec}).to_string());
    }
    for task in &plan.tasks {
        lines.push(task_to_record(task).to_string());
    }
    for issue in &plan.issues {
        lines.push(issue_to_record(issue).to_string());
    }
    for tomb in &plan.accepted {
        lines.push(tombstone_to_record(tomb).to_string());
    }
    for tomb in &plan.rejected {
        lines.push(tombstone_to_record(tomb).to_string());
    }

    let contents = if lines.is_empty() {
        String::new()
    } else {
        let mut s = lines.join("\n");
        s.push('\n');
        s
    };

    let tmp_path = path.with_extension("jsonl.tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Group rejected tombstones by task ID, for rejection-pattern analysis.
pub fn rejections_by_task(rejected: &[Tombstone]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for t in rejected {
        map.entry(t.id.clone()).or_default().push(t.reason.clone());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    #[test]
    fn task_record_roundtrip_preserves_fields() {
        let mut task = Task::new("t-abc123", "do the thing", "s.md");
        task.notes = Some("be careful".into());
        task.deps = Some(vec!["t-dep1".into()]);
        task.priority = Some(Priority::High);
        task.decompose_depth = 2;

        let record = task_to_record(&task);
        let back = task_from_record(record.as_object().unwrap()).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn task_record_omits_empty_optional_fields() {
        let task = Task::new("t-abc123", "n", "s.md");
        let record = task_to_record(&task);
        let obj = record.as_object().unwrap();
        assert!(!obj.contains_key("notes"));
        assert!(!obj.contains_key("deps"));
        assert!(!obj.contains_key("decompose"));
        assert!(!obj.contains_key("decompose_depth"));
    }

    #[test]
    fn task_record_uses_short_status_keys() {
        let mut task = Task::new("t-1", "n", "s.md");
        assert_eq!(task_to_record(&task)["s"], "p");
        task.mark_done("2024-01-01T00:00:00Z");
        assert_eq!(task_to_record(&task)["s"], "d");
    }

    #[test]
    fn task_from_record_falls_back_to_legacy_desc_field() {
        let record = json!({"t": "task", "id": "t-1", "desc": "legacy name", "s": "p"});
        let task = task_from_record(record.as_object().unwrap()).unwrap();
        assert_eq!(task.name, "legacy name");
    }

    #[test]
    fn save_then_load_roundtrips_whole_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.jsonl");

        let mut plan = PlanFile::default();
        plan.spec = Some("spec.md".into());
        plan.tasks.push(Task::new("t-1", "first", "spec.md"));
        plan.issues.push(Issue::new("i-1", "found a bug", "spec.md"));
        plan.accepted.push(Tombstone::accept("t-0", "2024-01-01T00:00:00Z", "looks good"));

        save(&path, &plan).unwrap();
        let loaded = load(&path);

        assert_eq!(loaded.spec, plan.spec);
        assert_eq!(loaded.tasks, plan.tasks);
        assert_eq!(loaded.issues, plan.issues);
        assert_eq!(loaded.accepted, plan.accepted);
    }

    #[test]
    fn save_writes_in_normative_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.jsonl");

        let mut plan = PlanFile::default();
        plan.spec = Some("spec.md".into());
        plan.tasks.push(Task::new("t-1", "n", "spec.md"));
        plan.issues.push(Issue::new("i-1", "d", "spec.md"));
        plan.rejected.push(Tombstone::reject("t-0", "2024-01-01T00:00:00Z", "bad"));
        save(&path, &plan).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let types: Vec<&str> = contents
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["t"].as_str().unwrap().to_string())
            .collect::<Vec<_>>()
            .iter()
            .map(|s| Box::leak(s.clone().into_boxed_str()) as &str)
            .collect();
        assert_eq!(types, vec!["config", "spec", "task", "issue", "reject"]);
    }

    #[test]
    fn load_missing_file_is_empty_state() {
        let plan = load(Path::new("/nonexistent/plan.jsonl"));
        assert!(plan.tasks.is_empty());
        assert!(plan.issues.is_empty());
    }

    #[test]
    fn load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.jsonl");
        std::fs::write(
            &path,
            "{\"t\": \"task\", \"id\": \"t-1\", \"name\": \"ok\", \"s\": \"p\"}\nnot json\n{\"t\": \"task\"\n",
        )
        .unwrap();

        let plan = load(&path);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].id, "t-1");
    }

    #[test]
    fn completed_ids_includes_done_tasks_and_accept_tombstones() {
        let mut plan = PlanFile::default();
        let mut done_task = Task::new("t-1", "n", "s.md");
        done_task.status = TaskStatus::Done;
        plan.tasks.push(done_task);
        plan.accepted.push(Tombstone::accept("t-2", "2024-01-01T00:00:00Z", "ok"));

        let ids = plan.completed_ids();
        assert!(ids.contains("t-1"));
        assert!(ids.contains("t-2"));
    }
}
