//! `ralph query`: single-value lookups for scripting.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;

use ralph_core::ticket_store::TixClient;
use ralph_core::{ledger, orch_state, scheduler, TicketStore};

use crate::paths::Paths;

pub enum Target {
    Stage,
    Tasks,
    Issues,
    Iteration,
    Next,
}

pub async fn run(repo_root: &Path, target: Target) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);
    let store = TixClient::new(repo_root);

    match target {
        Target::Stage => {
            let state = orch_state::load(&paths.state_path);
            println!("{}", state.stage);
        }
        Target::Tasks => {
            let pending = store.list_pending().await.context("failed to list pending tasks")?;
            println!("{}", pending.len());
            for task in &pending {
                println!("{}", task.id);
            }
        }
        Target::Issues => {
            let issues = store.list_issues().await.context("failed to list issues")?;
            println!("{}", issues.len());
            for issue in &issues {
                println!("{}", issue.id);
            }
        }
        Target::Iteration => {
            let state = orch_state::load(&paths.state_path);
            let runs = ledger::load_runs(&paths.log_dir);
            let iterations = runs
                .iter()
                .filter(|r| match (&state.spec, r.get("spec").and_then(|s| s.as_str())) {
                    (Some(spec), Some(run_spec)) => spec == run_spec,
                    _ => true,
                })
                .filter_map(|r| r.get("iterations").and_then(|i| i.as_u64()))
                .last()
                .unwrap_or(0);
            println!("{iterations}");
        }
        Target::Next => {
            let pending = store.list_pending().await.context("failed to list pending tasks")?;
            let done = store.list_done().await.context("failed to list done tasks")?;
            let completed_ids: HashSet<String> = done.into_iter().map(|t| t.id).collect();
            let retry_counts: HashMap<String, u32> = HashMap::new();
            match scheduler::pick_best_task(&pending, &completed_ids, &retry_counts) {
                Some(task) => println!("{}: {}", task.id, task.name),
                None => println!("(none)"),
            }
        }
    }
    Ok(())
}
