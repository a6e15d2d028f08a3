//! `ralph compact`: trim old resolved tombstones out of the bootstrap plan
//! file so it doesn't grow without bound across the life of a repo.

use std::path::Path;

use anyhow::Context;

use ralph_core::plan_file;

/// How many tombstones of each kind to keep, most recent first.
const RETAIN: usize = 200;

pub fn run(repo_root: &Path) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = crate::paths::Paths::resolve(repo_root, &config);

    let mut plan = plan_file::load(&paths.plan_path);

    let dropped_accepted = plan.accepted.len().saturating_sub(RETAIN);
    let dropped_rejected = plan.rejected.len().saturating_sub(RETAIN);
    if dropped_accepted > 0 {
        plan.accepted.drain(0..dropped_accepted);
    }
    if dropped_rejected > 0 {
        plan.rejected.drain(0..dropped_rejected);
    }

    plan_file::save(&paths.plan_path, &plan)
        .with_context(|| format!("failed to write {}", paths.plan_path.display()))?;

    println!(
        "dropped {} accept and {} reject tombstones, kept {} and {}",
        dropped_accepted,
        dropped_rejected,
        plan.accepted.len(),
        plan.rejected.len()
    );
    Ok(())
}
