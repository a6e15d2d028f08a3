//! Orchestration state: the construct state machine's persisted position.
//!
//! Distinct from [`crate::plan_file`]: the plan file holds tasks/issues and
//! is shared with the ticket store, while this file is exclusively owned by
//! the orchestrator process (`state.json`, never touched by `tix`).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current position in the construct loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Plan,
    Investigate,
    Build,
    Verify,
    Decompose,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageParseError(pub &'static str);

impl fmt::Display for StageParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stage: {}", self.0)
    }
}
impl std::error::Error for StageParseError {}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Plan => "PLAN",
            Stage::Investigate => "INVESTIGATE",
            Stage::Build => "BUILD",
            Stage::Verify => "VERIFY",
            Stage::Decompose => "DECOMPOSE",
            Stage::Complete => "COMPLETE",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Stage {
    type Err = StageParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAN" => Ok(Stage::Plan),
            "INVESTIGATE" => Ok(Stage::Investigate),
            "BUILD" => Ok(Stage::Build),
            "VERIFY" => Ok(Stage::Verify),
            "DECOMPOSE" => Ok(Stage::Decompose),
            "COMPLETE" => Ok(Stage::Complete),
            // A legacy recovery stage that no longer exists as a distinct
            // dispatch target; any state file carrying it resumes at
            // INVESTIGATE instead.
            "RESCUE" => Ok(Stage::Investigate),
            _ => Err(StageParseError("unrecognized stage name")),
        }
    }
}

/// Metadata retained only so a legacy state file carrying a `rescue` block
/// round-trips without data loss. Never written by this implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyRescue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The construct state machine's persisted position between iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_batch_items: Vec<String>,
    #[serde(default)]
    pub batch_retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decompose_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_log: Option<String>,
    /// Present only when loaded from a file that still carries the legacy
    /// `rescue` block; never emitted on save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_rescue: Option<LegacyRescue>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        OrchestrationState {
            stage: Stage::Plan,
            spec: None,
            batch_items: Vec::new(),
            completed_batch_items: Vec::new(),
            batch_retry_count: 0,
            decompose_target: None,
            kill_reason: None,
            kill_log: None,
            legacy_rescue: None,
        }
    }
}

impl OrchestrationState {
    pub fn new(spec: impl Into<String>) -> Self {
        OrchestrationState {
            spec: Some(spec.into()),
            ..Default::default()
        }
    }

    pub fn clear_batch(&mut self) {
        self.batch_items.clear();
        self.completed_batch_items.clear();
        self.batch_retry_count = 0;
    }

    pub fn transition_to_investigate(&mut self) {
        self.stage = Stage::Investigate;
        self.decompose_target = None;
        self.clear_batch();
    }

    pub fn transition_to_build(&mut self) {
        self.stage = Stage::Build;
        self.clear_batch();
    }

    pub fn transition_to_verify(&mut self) {
        self.stage = Stage::Verify;
        self.clear_batch();
    }

    pub fn transition_to_decompose(
        &mut self,
        task_id: impl Into<String>,
        reason: impl Into<String>,
        kill_log: Option<String>,
    ) {
        self.stage = Stage::Decompose;
        self.decompose_target = Some(task_id.into());
        self.kill_reason = Some(reason.into());
        self.kill_log = kill_log;
    }

    pub fn transition_to_complete(&mut self) {
        self.stage = Stage::Complete;
        self.clear_batch();
    }
}

/// Load orchestration state from `path`. Missing file yields a fresh
/// default state rather than an error — a construct run bootstraps its own
/// state on first invocation.
pub fn load(path: &Path) -> OrchestrationState {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return OrchestrationState::default(),
    };
    match serde_json::from_str::<RawState>(&contents) {
        Ok(raw) => raw.into_state(),
        Err(_) => OrchestrationState::default(),
    }
}

pub fn save(path: &Path, state: &OrchestrationState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state).expect("OrchestrationState always serializes");
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Tolerant wire shape: accepts a raw `stage` string (including the legacy
/// `RESCUE` spelling) via `FromStr` rather than deriving `Deserialize`
/// directly on `Stage`, since legacy files are not expected to round-trip
/// through serde's enum representation.
#[derive(Deserialize)]
struct RawState {
    stage: String,
    #[serde(default)]
    spec: Option<String>,
    #[serde(default)]
    batch_items: Vec<String>,
    #[serde(default)]
    completed_batch_items: Vec<String>,
    #[serde(default)]
    batch_retry_count: u32,
    #[serde(default)]
    decompose_target: Option<String>,
    #[serde(default)]
    kill_reason: Option<String>,
    #[serde(default)]
    kill_log: Option<String>,
    #[serde(default)]
    rescue: Option<LegacyRescue>,
}

impl RawState {
    fn into_state(self) -> OrchestrationState {
        let was_rescue = self.stage == "RESCUE";
        let stage = self.stage.parse().unwrap_or(Stage::Plan);
        OrchestrationState {
            stage,
            spec: self.spec,
            batch_items: self.batch_items,
            completed_batch_items: self.completed_batch_items,
            batch_retry_count: self.batch_retry_count,
            decompose_target: self.decompose_target,
            kill_reason: self.kill_reason,
            kill_log: self.kill_log,
            legacy_rescue: if was_rescue { self.rescue } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrips_through_display_and_fromstr() {
        for s in [
            Stage::Plan,
            Stage::Investigate,
            Stage::Build,
            Stage::Verify,
            Stage::Decompose,
            Stage::Complete,
        ] {
            assert_eq!(s.to_string().parse::<Stage>().unwrap(), s);
        }
    }

    #[test]
    fn legacy_rescue_stage_parses_to_investigate() {
        assert_eq!("RESCUE".parse::<Stage>().unwrap(), Stage::Investigate);
    }

    #[test]
    fn load_missing_file_yields_default_state() {
        let state = load(Path::new("/nonexistent/state.json"));
        assert_eq!(state.stage, Stage::Plan);
        assert!(state.spec.is_none());
    }

    #[test]
    fn load_migrates_legacy_rescue_stage_and_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"stage": "RESCUE", "spec": "s.md", "rescue": {"stage": "BUILD", "batch_items": ["t-1"]}}"#,
        )
        .unwrap();

        let state = load(&path);
        assert_eq!(state.stage, Stage::Investigate);
        assert_eq!(state.legacy_rescue.unwrap().stage.as_deref(), Some("BUILD"));
    }

    #[test]
    fn save_then_load_roundtrips_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = OrchestrationState::new("s.md");
        state.transition_to_decompose("t-1", "max retries", Some("/tmp/log".into()));
        save(&path, &state).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.stage, Stage::Decompose);
        assert_eq!(loaded.decompose_target.as_deref(), Some("t-1"));
        assert!(loaded.legacy_rescue.is_none());
    }

    #[test]
    fn transition_to_investigate_clears_decompose_target_and_batch() {
        let mut state = OrchestrationState::new("s.md");
        state.transition_to_decompose("t-1", "r", None);
        state.batch_items = vec!["t-1".into()];

        state.transition_to_investigate();
        assert_eq!(state.stage, Stage::Investigate);
        assert!(state.decompose_target.is_none());
        assert!(state.batch_items.is_empty());
    }
}
