//! `ralph status`: current stage, active spec, and ticket-store counts.

use std::path::Path;

use anyhow::Context;

use ralph_core::ticket_store::TixClient;
use ralph_core::{orch_state, TicketStore};

use crate::paths::Paths;

pub async fn run(repo_root: &Path) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);

    let state = orch_state::load(&paths.state_path);
    let store = TixClient::new(repo_root);

    println!("stage: {}", state.stage);
    println!("spec: {}", state.spec.as_deref().unwrap_or("(none)"));

    if !store.is_available().await {
        println!("ticket store: unavailable");
        return Ok(());
    }

    let pending = store.list_pending().await.context("failed to list pending tasks")?;
    let done = store.list_done().await.context("failed to list done tasks")?;
    let issues = store.list_issues().await.context("failed to list issues")?;

    println!("tasks: {} pending, {} done", pending.len(), done.len());
    println!("issues: {} open", issues.len());

    if let Some(reason) = &state.kill_reason {
        println!("last kill: {reason}");
    }
    Ok(())
}
