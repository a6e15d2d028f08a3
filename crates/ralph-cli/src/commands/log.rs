//! `ralph log`: run/iteration ledger history.

use std::path::Path;

use ralph_core::ledger;

use crate::paths::Paths;

pub fn run(
    repo_root: &Path,
    all: bool,
    spec: Option<String>,
    branch: Option<String>,
    since: Option<String>,
) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);

    let runs = ledger::load_runs(&paths.log_dir);
    let matches = |run: &serde_json::Value| -> bool {
        if let Some(spec) = &spec {
            if run.get("spec").and_then(|v| v.as_str()) != Some(spec.as_str()) {
                return false;
            }
        }
        if let Some(branch) = &branch {
            if run.get("branch").and_then(|v| v.as_str()) != Some(branch.as_str()) {
                return false;
            }
        }
        if let Some(since) = &since {
            let started = run.get("started_at").and_then(|v| v.as_str()).unwrap_or("");
            if started < since.as_str() {
                return false;
            }
        }
        true
    };

    let filtered: Vec<&serde_json::Value> = runs.iter().filter(|r| matches(r)).collect();
    if filtered.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }

    for run in &filtered {
        println!(
            "{} spec={} branch={} iterations={} exit={} cost={:.2}",
            run.get("run_id").and_then(|v| v.as_str()).unwrap_or("?"),
            run.get("spec").and_then(|v| v.as_str()).unwrap_or("?"),
            run.get("branch").and_then(|v| v.as_str()).unwrap_or("?"),
            run.get("iterations").and_then(|v| v.as_u64()).unwrap_or(0),
            run.get("exit_reason").and_then(|v| v.as_str()).unwrap_or("?"),
            run.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
        );

        if all {
            let run_id = run.get("run_id").and_then(|v| v.as_str());
            for iteration in ledger::load_iterations(&paths.log_dir, run_id) {
                println!(
                    "  iter {} stage={} outcome={} task={}",
                    iteration.get("iteration").and_then(|v| v.as_u64()).unwrap_or(0),
                    iteration.get("stage").and_then(|v| v.as_str()).unwrap_or("?"),
                    iteration.get("outcome").and_then(|v| v.as_str()).unwrap_or("?"),
                    iteration.get("task_id").and_then(|v| v.as_str()).unwrap_or(""),
                );
            }
        }
    }
    Ok(())
}
