//! Shared path resolution: where the ralph directory, plan bootstrap file,
//! orchestration state, and prompt templates live relative to a repo.

use std::path::{Path, PathBuf};

use ralph_core::GlobalConfig;

pub struct Paths {
    pub repo_root: PathBuf,
    pub ralph_dir: PathBuf,
    pub specs_dir: PathBuf,
    pub state_path: PathBuf,
    pub plan_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    pub fn resolve(repo_root: &Path, config: &GlobalConfig) -> Self {
        let ralph_dir = repo_root.join(&config.ralph_dir);
        Paths {
            repo_root: repo_root.to_path_buf(),
            specs_dir: ralph_dir.join("specs"),
            state_path: ralph_dir.join("state.json"),
            plan_path: ralph_dir.join("plan.jsonl"),
            log_dir: PathBuf::from(&config.log_dir),
            ralph_dir,
        }
    }
}
