//! Ticket store interface: a narrow abstraction over the external ticket
//! CLI. All mutations go through it; the agent process never calls it
//! directly — the reconciler does.
//!
//! The implementation shells out to a `tix`-compatible binary, one
//! invocation per call, each with a 30-second timeout. A non-zero exit or a
//! timeout becomes a [`TixError`] that is never silently swallowed above
//! the reconciler boundary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

use crate::model::{Issue, Priority, Task};
use crate::plan_file::{issue_from_record, task_from_record};

const INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BINARY_RELATIVE_PATH: &str = "powerplant/tix";

#[derive(Debug, Error)]
pub enum TixError {
    #[error("ticket store unavailable: {0}")]
    Unavailable(String),
    #[error("tix exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
    #[error("tix invocation timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn tix binary: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("could not parse tix output: {0}")]
    Parse(String),
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn list_pending(&self) -> Result<Vec<Task>, TixError>;
    async fn list_done(&self) -> Result<Vec<Task>, TixError>;
    async fn list_issues(&self) -> Result<Vec<Issue>, TixError>;

    async fn task_add(&self, task: &Task) -> Result<String, TixError>;
    async fn task_batch_add(&self, tasks: &[Task]) -> Result<Vec<String>, TixError>;
    async fn task_done(&self, id: Option<&str>) -> Result<(), TixError>;
    async fn task_accept(&self, id: Option<&str>) -> Result<(), TixError>;
    async fn task_reject(&self, id: &str, reason: &str) -> Result<(), TixError>;
    async fn task_delete(&self, id: &str) -> Result<(), TixError>;
    async fn task_prioritize(&self, id: &str, priority: Priority) -> Result<(), TixError>;

    async fn issue_add(&self, desc: &str, priority: Option<Priority>) -> Result<String, TixError>;
    async fn issue_done(&self, id: &str) -> Result<(), TixError>;
    async fn issue_done_all(&self) -> Result<(), TixError>;
    async fn issue_done_ids(&self, ids: &[String]) -> Result<(), TixError>;

    async fn validate(&self) -> Result<bool, TixError>;
    async fn status(&self) -> Result<String, TixError>;
    async fn is_available(&self) -> bool;
}

/// Shells out to the `tix` binary for every call.
pub struct TixClient {
    binary: PathBuf,
    cwd: PathBuf,
}

impl TixClient {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let binary = repo_root.join(DEFAULT_BINARY_RELATIVE_PATH);
        TixClient { binary, cwd: repo_root }
    }

    pub fn with_binary(repo_root: impl Into<PathBuf>, binary: impl Into<PathBuf>) -> Self {
        TixClient {
            binary: binary.into(),
            cwd: repo_root.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TixError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.current_dir(&self.cwd);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(TixError::Spawn)?;
        let output = match tokio::time::timeout(INVOCATION_TIMEOUT, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TixError::Spawn(e)),
            Err(_) => return Err(TixError::Timeout(INVOCATION_TIMEOUT)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TixError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_json(&self, args: &[&str]) -> Result<Value, TixError> {
        let stdout = self.run(args).await?;
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| TixError::Parse(e.to_string()))
    }
}

fn extract_id(value: &Value) -> Result<String, TixError> {
    value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| TixError::Parse("response missing `id` field".to_string()))
}

#[async_trait]
impl TicketStore for TixClient {
    async fn list_pending(&self) -> Result<Vec<Task>, TixError> {
        let value = self.run_json(&["query", "tasks"]).await?;
        decode_tasks(&value)
    }

    async fn list_done(&self) -> Result<Vec<Task>, TixError> {
        let value = self.run_json(&["query", "tasks", "--done"]).await?;
        decode_tasks(&value)
    }

    async fn list_issues(&self) -> Result<Vec<Issue>, TixError> {
        let value = self.run_json(&["query", "issues"]).await?;
        let array = value
            .as_array()
            .ok_or_else(|| TixError::Parse("expected a JSON array of issues".to_string()))?;
        array
            .iter()
            .map(|v| {
                v.as_object()
                    .ok_or_else(|| TixError::Parse("issue record was not an object".to_string()))
                    .and_then(|obj| issue_from_record(obj).map_err(|e| TixError::Parse(e.to_string())))
            })
            .collect()
    }

    async fn task_add(&self, task: &Task) -> Result<String, TixError> {
        let payload = crate::plan_file::task_to_record(task).to_string();
        let value = self.run_json(&["task", "add", &payload]).await?;
        extract_id(&value)
    }

    async fn task_batch_add(&self, tasks: &[Task]) -> Result<Vec<String>, TixError> {
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(self.task_add(task).await?);
        }
        Ok(ids)
    }

    async fn task_done(&self, id: Option<&str>) -> Result<(), TixError> {
        match id {
            Some(id) => self.run(&["task", "done", id]).await.map(|_| ()),
            None => self.run(&["task", "done"]).await.map(|_| ()),
        }
    }

    async fn task_accept(&self, id: Option<&str>) -> Result<(), TixError> {
        match id {
            Some(id) => self.run(&["task", "accept", id]).await.map(|_| ()),
            None => self.run(&["task", "accept"]).await.map(|_| ()),
        }
    }

    async fn task_reject(&self, id: &str, reason: &str) -> Result<(), TixError> {
        self.run(&["task", "reject", id, reason]).await.map(|_| ())
    }

    async fn task_delete(&self, id: &str) -> Result<(), TixError> {
        self.run(&["task", "delete", id]).await.map(|_| ())
    }

    async fn task_prioritize(&self, id: &str, priority: Priority) -> Result<(), TixError> {
        let priority = priority.to_string();
        self.run(&["task", "prioritize", id, &priority]).await.map(|_| ())
    }

    async fn issue_add(&self, desc: &str, priority: Option<Priority>) -> Result<String, TixError> {
        let value = match priority {
            Some(p) => {
                let p = p.to_string();
                self.run_json(&["issue", "add", desc, "--priority", &p]).await?
            }
            None => self.run_json(&["issue", "add", desc]).await?,
        };
        extract_id(&value)
    }

    async fn issue_done(&self, id: &str) -> Result<(), TixError> {
        self.run(&["issue", "done", id]).await.map(|_| ())
    }

    async fn issue_done_all(&self) -> Result<(), TixError> {
        self.run(&["issue", "done-all"]).await.map(|_| ())
    }

    async fn issue_done_ids(&self, ids: &[String]) -> Result<(), TixError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["issue", "done-ids"];
        args.extend(ids.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    async fn validate(&self) -> Result<bool, TixError> {
        match self.run(&["validate"]).await {
            Ok(_) => Ok(true),
            Err(TixError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn status(&self) -> Result<String, TixError> {
        self.run(&["status"]).await
    }

    async fn is_available(&self) -> bool {
        self.run(&["status"]).await.is_ok()
    }
}

fn decode_tasks(value: &Value) -> Result<Vec<Task>, TixError> {
    let array = value
        .as_array()
        .ok_or_else(|| TixError::Parse("expected a JSON array of tasks".to_string()))?;
    array
        .iter()
        .map(|v| {
            v.as_object()
                .ok_or_else(|| TixError::Parse("task record was not an object".to_string()))
                .and_then(|obj| task_from_record(obj).map_err(|e| TixError::Parse(e.to_string())))
        })
        .collect()
}

/// Resolve the default binary path relative to a repo root, for callers
/// constructing a [`TixClient`] without an explicit override.
pub fn default_binary_path(repo_root: &Path) -> PathBuf {
    repo_root.join(DEFAULT_BINARY_RELATIVE_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binary_path_is_relative_to_repo_root() {
        let path = default_binary_path(Path::new("/repo"));
        assert_eq!(path, PathBuf::from("/repo/powerplant/tix"));
    }

    #[tokio::test]
    async fn is_available_is_false_when_binary_missing() {
        let client = TixClient::with_binary("/tmp", "/definitely/not/a/real/tix/binary");
        assert!(!client.is_available().await);
    }

    #[tokio::test]
    async fn status_surfaces_spawn_error_for_missing_binary() {
        let client = TixClient::with_binary("/tmp", "/definitely/not/a/real/tix/binary");
        let result = client.status().await;
        assert!(matches!(result, Err(TixError::Spawn(_))));
    }

    #[test]
    fn extract_id_requires_id_field() {
        let value = serde_json::json!({"name": "no id here"});
        assert!(extract_id(&value).is_err());
    }

    #[test]
    fn decode_tasks_requires_array() {
        let value = serde_json::json!({"not": "an array"});
        assert!(decode_tasks(&value).is_err());
    }
}
