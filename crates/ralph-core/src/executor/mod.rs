//! Agent executor adapter: spawns one subprocess per stage invocation and
//! turns its output into a structured result.
//!
//! Exposed behind a small trait ([`AgentExecutor`]) purely for testability —
//! stage runners and the state machine can be driven against a fake in
//! tests without spawning real subprocesses. There is exactly one
//! production implementation; this is not a multi-backend registry.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::orch_state::Stage;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn agent binary '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

/// A parsed line of agent output. Unrecognized JSON events are passed
/// through as [`AgentEvent::Raw`]; non-JSON lines become [`AgentEvent::Text`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    ToolUse { tool: String, input: Value },
    StepFinish {
        cost: f64,
        tokens_in: u64,
        tokens_cache_read: u64,
        tokens_out: u64,
    },
    Error { message: String },
    Assistant { content: String },
    Raw(Value),
}

/// Running totals accumulated from a stream of [`AgentEvent`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecMetrics {
    pub cost: f64,
    pub tokens_in: u64,
    pub tokens_cache_read: u64,
    pub tokens_out: u64,
    pub iterations: u32,
}

impl ExecMetrics {
    pub fn record(&mut self, event: &AgentEvent) {
        if let AgentEvent::StepFinish {
            cost,
            tokens_in,
            tokens_cache_read,
            tokens_out,
        } = event
        {
            self.cost += cost;
            self.tokens_in += tokens_in;
            self.tokens_cache_read += tokens_cache_read;
            self.tokens_out += tokens_out;
            self.iterations += 1;
        }
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_in + self.tokens_cache_read + self.tokens_out
    }
}

/// The outcome of one stage invocation. No interpretation of agent output
/// happens here — only transport; reconciliation is the reconciler's job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
    pub metrics: ExecMetrics,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run_stage(
        &self,
        stage: Stage,
        prompt: &str,
        cwd: &Path,
        timeout_ms: u64,
        model: Option<&str>,
        agent: Option<&str>,
    ) -> Result<ExecResult, ExecutorError>;
}

/// Parse a single line of agent output into zero-or-more events. A line
/// that is not valid JSON is treated as a plain text event rather than
/// discarded, matching the source's tolerant line classifier.
fn parse_line(line: &str) -> Vec<AgentEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return vec![AgentEvent::Text(line.to_string())],
    };

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "step_finish" => {
            let part = value.get("part").unwrap_or(&Value::Null);
            let cost = part.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let tokens = part.get("tokens").unwrap_or(&Value::Null);
            let tokens_in = tokens.get("input").and_then(|v| v.as_u64()).unwrap_or(0);
            let tokens_cache_read = tokens
                .get("cache")
                .and_then(|c| c.get("read"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let tokens_out = tokens.get("output").and_then(|v| v.as_u64()).unwrap_or(0);
            vec![AgentEvent::StepFinish {
                cost,
                tokens_in,
                tokens_cache_read,
                tokens_out,
            }]
        }
        "tool_use" => {
            let tool = value
                .get("tool")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let input = value.get("input").cloned().unwrap_or(Value::Null);
            vec![AgentEvent::ToolUse { tool, input }]
        }
        "error" => {
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            vec![AgentEvent::Error { message }]
        }
        "assistant" => {
            let content = value
                .get("content")
                .or_else(|| value.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            vec![AgentEvent::Assistant { content }]
        }
        "text" => {
            let content = value.get("text").and_then(|v| v.as_str()).unwrap_or("");
            vec![AgentEvent::Text(content.to_string())]
        }
        _ => vec![AgentEvent::Raw(value)],
    }
}

/// Parse every non-empty line of a captured transcript and fold the
/// resulting events into a metrics total. Used both by the live executor
/// and by tests that feed it canned transcripts.
pub fn accumulate_metrics(output: &str) -> ExecMetrics {
    let mut metrics = ExecMetrics::default();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for event in parse_line(line) {
            metrics.record(&event);
        }
    }
    metrics
}

/// Spawns the `opencode` binary once per stage invocation.
pub struct OpencodeExecutor {
    binary_path: String,
}

impl OpencodeExecutor {
    pub fn new() -> Self {
        OpencodeExecutor {
            binary_path: "opencode".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        OpencodeExecutor {
            binary_path: path.into(),
        }
    }
}

impl Default for OpencodeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for OpencodeExecutor {
    async fn run_stage(
        &self,
        stage: Stage,
        prompt: &str,
        cwd: &Path,
        timeout_ms: u64,
        model: Option<&str>,
        agent: Option<&str>,
    ) -> Result<ExecResult, ExecutorError> {
        let mut permission = serde_json::json!({"external_directory": "deny", "doom_loop": "deny"});
        if stage == Stage::Decompose {
            permission["read"] = serde_json::json!({"*": "allow"});
        }

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("run").arg("--format").arg("json");
        if let Some(model) = model {
            cmd.arg("--model").arg(model);
        }
        if let Some(agent) = agent {
            cmd.arg("--agent").arg(agent);
        }
        cmd.arg(prompt);
        cmd.current_dir(cwd);
        cmd.env("XDG_STATE_HOME", "/tmp/ralph-opencode-state");
        cmd.env("OPENCODE_PERMISSION", permission.to_string());
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            binary: self.binary_path.clone(),
            source,
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let collect = async {
            let mut output = String::new();
            let mut metrics = ExecMetrics::default();

            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    line = out_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                for event in parse_line(&line) {
                                    metrics.record(&event);
                                }
                                output.push_str(&line);
                                output.push('\n');
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    line = err_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                output.push_str(&line);
                                output.push('\n');
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    else => break,
                }
            }
            (output, metrics)
        };

        let timeout = std::time::Duration::from_millis(timeout_ms);
        match tokio::time::timeout(timeout, collect).await {
            Ok((output, metrics)) => {
                let status = child.wait().await.map_err(|source| ExecutorError::Spawn {
                    binary: self.binary_path.clone(),
                    source,
                })?;
                Ok(ExecResult {
                    exit_code: status.code().unwrap_or(-1),
                    output,
                    timed_out: false,
                    metrics,
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                Ok(ExecResult {
                    exit_code: -1,
                    output: String::new(),
                    timed_out: true,
                    metrics: ExecMetrics::default(),
                })
            }
        }
    }
}

/// A stream-oriented view over events, for callers (like the stream
/// prettifier in the CLI) that want to react as output arrives rather than
/// waiting for the whole stage to finish.
pub fn event_stream(output: String) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
    let events: Vec<AgentEvent> = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .flat_map(parse_line)
        .collect();
    Box::pin(tokio_stream::iter(events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_classifies_step_finish() {
        let line = r#"{"type":"step_finish","part":{"cost":0.05,"tokens":{"input":100,"output":20,"cache":{"read":5}}}}"#;
        let events = parse_line(line);
        match &events[0] {
            AgentEvent::StepFinish { cost, tokens_in, tokens_cache_read, tokens_out } => {
                assert_eq!(*cost, 0.05);
                assert_eq!(*tokens_in, 100);
                assert_eq!(*tokens_cache_read, 5);
                assert_eq!(*tokens_out, 20);
            }
            other => panic!("expected StepFinish, got {other:?}"),
        }
    }

    #[test]
    fn parse_line_falls_back_to_text_for_non_json() {
        let events = parse_line("plain log line, not json");
        assert_eq!(events, vec![AgentEvent::Text("plain log line, not json".to_string())]);
    }

    #[test]
    fn parse_line_passes_through_unrecognized_event_types() {
        let events = parse_line(r#"{"type":"custom_thing","foo":"bar"}"#);
        assert!(matches!(events[0], AgentEvent::Raw(_)));
    }

    #[test]
    fn accumulate_metrics_sums_across_multiple_step_finish_events() {
        let output = concat!(
            r#"{"type":"step_finish","part":{"cost":0.1,"tokens":{"input":10,"output":5,"cache":{"read":0}}}}"#,
            "\n",
            r#"{"type":"step_finish","part":{"cost":0.2,"tokens":{"input":20,"output":10,"cache":{"read":1}}}}"#,
            "\n",
        );
        let metrics = accumulate_metrics(output);
        assert_eq!(metrics.iterations, 2);
        assert!((metrics.cost - 0.3).abs() < 1e-9);
        assert_eq!(metrics.tokens_in, 30);
        assert_eq!(metrics.tokens_out, 15);
        assert_eq!(metrics.tokens_cache_read, 1);
    }

    #[test]
    fn accumulate_metrics_skips_malformed_lines_without_panicking() {
        let output = "not json\n{\"type\": \"step_finish\"\nmore garbage\n";
        let metrics = accumulate_metrics(output);
        assert_eq!(metrics.iterations, 0);
    }

    #[tokio::test]
    async fn run_stage_reports_spawn_failure_for_missing_binary() {
        let executor = OpencodeExecutor::with_binary("definitely-not-a-real-binary-xyz");
        let result = executor
            .run_stage(Stage::Build, "hello", Path::new("."), 5_000, None, None)
            .await;
        assert!(result.is_err());
    }
}
