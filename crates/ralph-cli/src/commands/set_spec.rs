//! `ralph set-spec`: switch the active spec file.

use std::path::Path;

use anyhow::Context;

use ralph_core::orch_state::{self, OrchestrationState};

use crate::paths::Paths;

pub fn run(repo_root: &Path, file: &str) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);

    let spec_path = repo_root.join(file);
    if !spec_path.exists() {
        anyhow::bail!("spec file not found: {}", spec_path.display());
    }

    let mut state = orch_state::load(&paths.state_path);
    if state.spec.as_deref() != Some(file) {
        state = OrchestrationState::new(file.to_string());
    }
    orch_state::save(&paths.state_path, &state)
        .with_context(|| format!("failed to write {}", paths.state_path.display()))?;

    println!("active spec: {file}");
    Ok(())
}
