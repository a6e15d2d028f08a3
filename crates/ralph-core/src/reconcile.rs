//! Reconciler: turns an agent's structured output block into ticket-store
//! mutations.
//!
//! Output is expected between `[RALPH_OUTPUT]` / `[/RALPH_OUTPUT]` markers.
//! If the markers are missing, the last balanced `{...}` object in the text
//! is used instead. If neither yields valid JSON, reconciliation returns an
//! empty, non-fatal result — a stage that produced no structured output is
//! a FAILURE at the stage-runner level, not a reconciler error.

use serde_json::Value;

use crate::model::{Priority, Task};
use crate::ticket_store::TicketStore;

const OUTPUT_MARKER: &str = "[RALPH_OUTPUT]";
const OUTPUT_END_MARKER: &str = "[/RALPH_OUTPUT]";

/// Summary of the mutations one reconciliation pass applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResult {
    pub ok: bool,
    pub tasks_added: Vec<String>,
    pub tasks_accepted: Vec<String>,
    pub tasks_rejected: Vec<String>,
    pub tasks_deleted: Vec<String>,
    pub issues_added: Vec<String>,
    pub issues_cleared: u32,
    pub errors: Vec<String>,
}

impl ReconcileResult {
    fn ok_default() -> Self {
        ReconcileResult {
            ok: true,
            ..Default::default()
        }
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.tasks_added.is_empty() {
            parts.push(format!("{} tasks added", self.tasks_added.len()));
        }
        if !self.tasks_accepted.is_empty() {
            parts.push(format!("{} accepted", self.tasks_accepted.len()));
        }
        if !self.tasks_rejected.is_empty() {
            parts.push(format!("{} rejected", self.tasks_rejected.len()));
        }
        if !self.tasks_deleted.is_empty() {
            parts.push(format!("{} deleted", self.tasks_deleted.len()));
        }
        if !self.issues_added.is_empty() {
            parts.push(format!("{} issues added", self.issues_added.len()));
        }
        if self.issues_cleared > 0 {
            parts.push(format!("{} issues cleared", self.issues_cleared));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Extract the structured output block from raw agent output: markers
/// first, then a balanced-brace scan from the end of the text.
pub fn extract_structured_output(agent_output: &str) -> Option<Value> {
    if let (Some(start), Some(end)) = (
        agent_output.find(OUTPUT_MARKER),
        agent_output.find(OUTPUT_END_MARKER),
    ) {
        let body_start = start + OUTPUT_MARKER.len();
        if body_start <= end {
            let body = agent_output[body_start..end].trim();
            if let Ok(value) = serde_json::from_str(body) {
                return Some(value);
            }
        }
    }
    find_last_json_object(agent_output)
}

/// Scan backwards from the last `}` for a balanced `{...}` substring,
/// trying each candidate (from tightest to widest) until one parses as a
/// JSON object.
fn find_last_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut close_positions = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'}' {
            close_positions.push(i);
        }
    }

    for &close in close_positions.iter().rev() {
        let mut depth = 0i32;
        let mut i = close as i64;
        while i >= 0 {
            match bytes[i as usize] {
                b'}' => depth += 1,
                b'{' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[i as usize..=close];
                        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                            if value.is_object() {
                                return Some(value);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
            i -= 1;
        }
    }
    None
}

fn str_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_priority(obj: &Value) -> Option<Priority> {
    str_field(obj, "priority").and_then(|s| s.parse().ok())
}

fn task_from_spec(obj: &Value, spec_file: &str) -> Task {
    let mut task = Task::new(
        crate::ids::gen_id("t"),
        str_field(obj, "name").unwrap_or_default(),
        spec_file,
    );
    task.notes = str_field(obj, "notes");
    task.accept = str_field(obj, "accept");
    task.deps = obj
        .get("deps")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect());
    task.priority = parse_priority(obj);
    task
}

/// PLAN stage: create each listed task, delete each dropped ID. Unknown
/// dropped IDs are silently ignored, matching ticket-store
/// delete-on-missing-ID semantics.
pub async fn reconcile_plan(
    store: &dyn TicketStore,
    output: &Value,
    spec_file: &str,
) -> ReconcileResult {
    let mut result = ReconcileResult::ok_default();

    if let Some(tasks) = output.get("tasks").and_then(|v| v.as_array()) {
        for t in tasks {
            let task = task_from_spec(t, spec_file);
            match store.task_add(&task).await {
                Ok(id) => result.tasks_added.push(id),
                Err(e) => result.errors.push(e.to_string()),
            }
        }
    }

    if let Some(drop) = output.get("drop").and_then(|v| v.as_array()) {
        for id in drop.iter().filter_map(|v| v.as_str()) {
            // Missing-ID deletes are tolerated, not reported as errors.
            let _ = store.task_delete(id).await;
            result.tasks_deleted.push(id.to_string());
        }
    }

    result.ok = result.errors.is_empty();
    result
}

/// BUILD stage: on `done`, mark the current task done; on `blocked`, reject
/// it with the given reason. Reported issues are always added.
pub async fn reconcile_build(
    store: &dyn TicketStore,
    output: &Value,
    current_task_id: &str,
    spec_file: &str,
) -> ReconcileResult {
    let mut result = ReconcileResult::ok_default();

    match output.get("verdict").and_then(|v| v.as_str()) {
        Some("done") => match store.task_done(Some(current_task_id)).await {
            Ok(()) => {}
            Err(e) => result.errors.push(e.to_string()),
        },
        Some("blocked") => {
            let reason = str_field(output, "reason").unwrap_or_else(|| "blocked".to_string());
            match store.task_reject(current_task_id, &reason).await {
                Ok(()) => result.tasks_rejected.push(current_task_id.to_string()),
                Err(e) => result.errors.push(e.to_string()),
            }
        }
        _ => result.errors.push("missing or unrecognized verdict".to_string()),
    }

    if let Some(issues) = output.get("issues").and_then(|v| v.as_array()) {
        for issue in issues {
            let desc = str_field(issue, "desc").unwrap_or_default();
            match store.issue_add(&desc, None).await {
                Ok(id) => result.issues_added.push(id),
                Err(e) => result.errors.push(e.to_string()),
            }
        }
    }
    let _ = spec_file;
    result.ok = result.errors.is_empty();
    result
}

/// VERIFY stage: accept passing task IDs, reject failing ones with evidence
/// or reason.
pub async fn reconcile_verify(store: &dyn TicketStore, output: &Value) -> ReconcileResult {
    let mut result = ReconcileResult::ok_default();
    let Some(results) = output.get("results").and_then(|v| v.as_array()) else {
        result.errors.push("missing `results` array".to_string());
        result.ok = false;
        return result;
    };

    for entry in results {
        let Some(task_id) = str_field(entry, "task_id") else {
            result.errors.push("result entry missing task_id".to_string());
            continue;
        };
        let passed = entry.get("passed").and_then(|v| v.as_bool()).unwrap_or(false);
        if passed {
            match store.task_accept(Some(&task_id)).await {
                Ok(()) => result.tasks_accepted.push(task_id),
                Err(e) => result.errors.push(e.to_string()),
            }
        } else {
            let reason = str_field(entry, "reason")
                .or_else(|| str_field(entry, "evidence"))
                .unwrap_or_else(|| "verify failed".to_string());
            match store.task_reject(&task_id, &reason).await {
                Ok(()) => result.tasks_rejected.push(task_id),
                Err(e) => result.errors.push(e.to_string()),
            }
        }
    }
    result.ok = result.errors.is_empty();
    result
}

/// INVESTIGATE stage: for `task` resolutions, create a linked task
/// (`created_from` set, priority inherited); every listed issue is resolved
/// either way.
pub async fn reconcile_investigate(
    store: &dyn TicketStore,
    output: &Value,
    spec_file: &str,
) -> ReconcileResult {
    let mut result = ReconcileResult::ok_default();
    let Some(results) = output.get("results").and_then(|v| v.as_array()) else {
        result.errors.push("missing `results` array".to_string());
        result.ok = false;
        return result;
    };

    let mut resolved_ids = Vec::new();
    for entry in results {
        let Some(issue_id) = str_field(entry, "issue_id") else {
            result.errors.push("result entry missing issue_id".to_string());
            continue;
        };

        if entry.get("resolution").and_then(|v| v.as_str()) == Some("task") {
            if let Some(task_spec) = entry.get("task") {
                let mut task = task_from_spec(task_spec, spec_file);
                task.created_from = Some(issue_id.clone());
                if task.priority.is_none() {
                    task.priority = parse_priority(entry);
                }
                match store.task_add(&task).await {
                    Ok(id) => result.tasks_added.push(id),
                    Err(e) => result.errors.push(e.to_string()),
                }
            }
        }
        resolved_ids.push(issue_id);
    }

    if !resolved_ids.is_empty() {
        match store.issue_done_ids(&resolved_ids).await {
            Ok(()) => result.issues_cleared = resolved_ids.len() as u32,
            Err(e) => result.errors.push(e.to_string()),
        }
    }

    result.ok = result.errors.is_empty();
    result
}

/// DECOMPOSE stage: create each subtask as a child of the failing task,
/// then delete the parent.
pub async fn reconcile_decompose(
    store: &dyn TicketStore,
    output: &Value,
    parent: &Task,
    spec_file: &str,
) -> ReconcileResult {
    let mut result = ReconcileResult::ok_default();
    let Some(subtasks) = output.get("subtasks").and_then(|v| v.as_array()) else {
        result.errors.push("missing `subtasks` array".to_string());
        result.ok = false;
        return result;
    };

    for sub in subtasks {
        let mut task = task_from_spec(sub, spec_file);
        task.parent = Some(parent.id.clone());
        task.decompose_depth = parent.decompose_depth + 1;
        match store.task_add(&task).await {
            Ok(id) => result.tasks_added.push(id),
            Err(e) => result.errors.push(e.to_string()),
        }
    }

    match store.task_delete(&parent.id).await {
        Ok(()) => result.tasks_deleted.push(parent.id.clone()),
        Err(e) => result.errors.push(e.to_string()),
    }

    result.ok = result.errors.is_empty();
    result
}

/// An actionable reconciliation is one that touched the ticket store.
/// Used by the stage runner's SUCCESS/FAILURE classification: reconciling
/// nothing while work was available is a failure.
pub fn made_progress(result: &ReconcileResult) -> bool {
    !result.tasks_added.is_empty()
        || !result.tasks_accepted.is_empty()
        || !result.tasks_rejected.is_empty()
        || !result.tasks_deleted.is_empty()
        || !result.issues_added.is_empty()
        || result.issues_cleared > 0
}
