//! Global configuration: defaults, TOML file, and profile overlay.
//!
//! Resolution order, low to high: built-in defaults, the `[default]` table
//! in `~/.config/ralph/config.toml` (if present), then the
//! `[profiles.<name>]` table named by the `RALPH_PROFILE` environment
//! variable (if both are set and the profile exists). Unlike the CLI flag
//! chain elsewhere in this crate, there is no per-run CLI override here —
//! callers that need one-off overrides construct a [`GlobalConfig`] and
//! mutate the relevant field directly rather than threading a flag through
//! this resolver. The result is built once by the CLI entry point and
//! passed down explicitly; nothing here is a global singleton.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Resolved configuration for a construct run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub model_build: String,
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default = "default_context_warn_pct")]
    pub context_warn_pct: u32,
    #[serde(default = "default_context_compact_pct")]
    pub context_compact_pct: u32,
    #[serde(default = "default_context_kill_pct")]
    pub context_kill_pct: u32,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_decompose_depth")]
    pub max_decompose_depth: u32,
    #[serde(default = "default_max_retries_per_task")]
    pub max_retries_per_task: u32,
    #[serde(default = "default_batch_size")]
    pub investigate_batch_size: u32,
    #[serde(default = "default_batch_size")]
    pub verify_batch_size: u32,
    #[serde(default = "default_issue_similarity_threshold")]
    pub issue_similarity_threshold: f64,
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    #[serde(default = "default_ralph_dir")]
    pub ralph_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Seconds of no progress before the state machine logs a stall
    /// warning. Informational only — it never aborts a run on its own;
    /// the global budgets (iteration/cost/token/wall-clock ceilings) are
    /// what actually stop a stuck run.
    #[serde(default = "default_progress_stall_warn_s")]
    pub progress_stall_warn_s: u64,
    #[serde(default = "default_max_wall_time_s")]
    pub max_wall_time_s: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    #[serde(default = "default_max_api_calls")]
    pub max_api_calls: u32,
    #[serde(default = "default_loop_detection_threshold")]
    pub loop_detection_threshold: usize,
}

fn default_context_window() -> u64 {
    200_000
}
fn default_context_warn_pct() -> u32 {
    70
}
fn default_context_compact_pct() -> u32 {
    85
}
fn default_context_kill_pct() -> u32 {
    95
}
fn default_stage_timeout_ms() -> u64 {
    900_000
}
fn default_max_failures() -> u32 {
    3
}
fn default_max_iterations() -> u32 {
    50
}
fn default_max_decompose_depth() -> u32 {
    3
}
fn default_max_retries_per_task() -> u32 {
    3
}
fn default_batch_size() -> u32 {
    5
}
fn default_issue_similarity_threshold() -> f64 {
    0.8
}
fn default_commit_prefix() -> String {
    "ralph:".to_string()
}
fn default_ralph_dir() -> String {
    "ralph".to_string()
}
fn default_log_dir() -> String {
    "/tmp/ralph-logs".to_string()
}
fn default_profile() -> String {
    "default".to_string()
}
fn default_progress_stall_warn_s() -> u64 {
    300
}
fn default_max_wall_time_s() -> u64 {
    6 * 3600
}
fn default_max_tokens() -> u64 {
    50_000_000
}
fn default_max_cost() -> f64 {
    50.0
}
fn default_max_api_calls() -> u32 {
    500
}
fn default_loop_detection_threshold() -> usize {
    3
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            model: String::new(),
            model_build: String::new(),
            context_window: default_context_window(),
            context_warn_pct: default_context_warn_pct(),
            context_compact_pct: default_context_compact_pct(),
            context_kill_pct: default_context_kill_pct(),
            stage_timeout_ms: default_stage_timeout_ms(),
            max_failures: default_max_failures(),
            max_iterations: default_max_iterations(),
            max_decompose_depth: default_max_decompose_depth(),
            max_retries_per_task: default_max_retries_per_task(),
            investigate_batch_size: default_batch_size(),
            verify_batch_size: default_batch_size(),
            issue_similarity_threshold: default_issue_similarity_threshold(),
            commit_prefix: default_commit_prefix(),
            ralph_dir: default_ralph_dir(),
            log_dir: default_log_dir(),
            profile: default_profile(),
            progress_stall_warn_s: default_progress_stall_warn_s(),
            max_wall_time_s: default_max_wall_time_s(),
            max_tokens: default_max_tokens(),
            max_cost: default_max_cost(),
            max_api_calls: default_max_api_calls(),
            loop_detection_threshold: default_loop_detection_threshold(),
        }
    }
}

/// Return the ralph config directory: `$XDG_CONFIG_HOME/ralph` or `~/.config/ralph`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("ralph");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ralph")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Raw TOML shape: a `[default]` table, a `[profiles.<name>]` table of
/// overlay tables, and any number of profile-scoped overrides.
#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    default: toml::Value,
    #[serde(default)]
    profiles: HashMap<String, toml::Value>,
}

/// Load, parse, and merge the on-disk config with the environment's chosen
/// profile. A missing or unparseable file is not an error: it yields
/// built-in defaults, matching the source's tolerant loader.
pub fn load() -> GlobalConfig {
    load_with_profile_env(std::env::var("RALPH_PROFILE").ok())
}

fn load_with_profile_env(profile_env: Option<String>) -> GlobalConfig {
    let contents = std::fs::read_to_string(config_path()).unwrap_or_default();
    let raw = toml::from_str::<RawConfigFile>(&contents).unwrap_or_default();

    let mut merged = toml::value::Table::new();

    // Tier 1: top-level keys outside `[default]`/`[profiles]`, kept for
    // backward compatibility with configs predating the `[default]` table.
    if let Ok(toml::Value::Table(whole_file)) = toml::from_str::<toml::Value>(&contents) {
        for (k, v) in &whole_file {
            if k != "default" && k != "profiles" {
                merged.insert(k.clone(), v.clone());
            }
        }
    }

    // Tier 2: the `[default]` table overlays tier 1.
    if let toml::Value::Table(default_table) = &raw.default {
        for (k, v) in default_table {
            merged.insert(k.clone(), v.clone());
        }
    }

    // Tier 3: the active `[profiles.<name>]` table overlays everything else.
    let mut resolved_profile = "default".to_string();
    if let Some(profile_name) = profile_env {
        if let Some(toml::Value::Table(profile_table)) = raw.profiles.get(&profile_name) {
            for (k, v) in profile_table {
                merged.insert(k.clone(), v.clone());
            }
            resolved_profile = profile_name;
        }
    }
    merged.insert("profile".to_string(), toml::Value::String(resolved_profile));

    GlobalConfig::deserialize(toml::Value::Table(merged)).unwrap_or_default()
}

/// List profile names available in the on-disk config file, for `ralph
/// profile list`-style commands.
pub fn available_profiles() -> Vec<String> {
    let raw = match std::fs::read_to_string(config_path()) {
        Ok(contents) => toml::from_str::<RawConfigFile>(&contents).unwrap_or_default(),
        Err(_) => return Vec::new(),
    };
    let mut names: Vec<String> = raw.profiles.keys().cloned().collect();
    names.sort();
    names
}

pub fn save_example(path: &PathBuf, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn defaults_match_fifteen_minute_stage_timeout() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.stage_timeout_ms, 900_000);
        assert_eq!(cfg.max_iterations, 50);
        assert_eq!(cfg.profile, "default");
    }

    #[test]
    fn load_without_config_file_yields_defaults() {
        let _lock = lock_env();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", "/nonexistent/xdg") };
        unsafe { std::env::remove_var("RALPH_PROFILE") };

        let cfg = load();
        assert_eq!(cfg, GlobalConfig::default());

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn default_table_overlays_builtin_defaults() {
        let _lock = lock_env();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        unsafe { std::env::remove_var("RALPH_PROFILE") };

        let dir = tmp.path().join("ralph");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.toml"),
            "[default]\nmodel = \"claude-opus\"\nmax_iterations = 20\n",
        )
        .unwrap();

        let cfg = load();
        assert_eq!(cfg.model, "claude-opus");
        assert_eq!(cfg.max_iterations, 20);

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn top_level_keys_seed_base_layer_beneath_default_table() {
        let _lock = lock_env();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        unsafe { std::env::remove_var("RALPH_PROFILE") };

        let dir = tmp.path().join("ralph");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.toml"),
            "model = \"claude-haiku\"\nmax_iterations = 10\n\n[default]\nmax_iterations = 20\n",
        )
        .unwrap();

        let cfg = load();
        assert_eq!(cfg.model, "claude-haiku");
        assert_eq!(cfg.max_iterations, 20);

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn profile_overlay_wins_over_default_table() {
        let _lock = lock_env();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        unsafe { std::env::set_var("RALPH_PROFILE", "fast") };

        let dir = tmp.path().join("ralph");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.toml"),
            "[default]\nmax_iterations = 20\n\n[profiles.fast]\nmax_iterations = 5\n",
        )
        .unwrap();

        let cfg = load();
        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(cfg.profile, "fast");

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        unsafe { std::env::remove_var("RALPH_PROFILE") };
    }

    #[test]
    fn unknown_profile_name_is_ignored() {
        let _lock = lock_env();
        let tmp = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        unsafe { std::env::set_var("RALPH_PROFILE", "nonexistent") };

        let dir = tmp.path().join("ralph");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&dir.join("config.toml"), "[default]\nmax_iterations = 20\n").unwrap();

        let cfg = load();
        assert_eq!(cfg.max_iterations, 20);
        assert_eq!(cfg.profile, "default");

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        unsafe { std::env::remove_var("RALPH_PROFILE") };
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("ralph/config.toml"));
    }
}
