//! `ralph plan`: a single PLAN-stage invocation against a spec, seeding the
//! initial task list. Outside the construct loop proper — the state
//! machine treats PLAN as a no-op bootstrap check, so the actual agent
//! call lives here.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

use ralph_core::executor::{AgentExecutor, OpencodeExecutor};
use ralph_core::orch_state::{OrchestrationState, Stage};
use ralph_core::reconcile;
use ralph_core::ticket_store::TixClient;
use ralph_core::{orch_state, stages};

use crate::paths::Paths;

pub async fn run(repo_root: &Path, spec: &str, model: Option<&str>, agent: Option<&str>) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);

    let spec_path = repo_root.join(spec);
    if !spec_path.exists() {
        anyhow::bail!("spec file not found: {}", spec_path.display());
    }

    let template = stages::prompt::load_with_project_rules(&paths.ralph_dir, stages::prompt_filename(Stage::Plan), repo_root)
        .with_context(|| format!("failed to load {}", stages::prompt_filename(Stage::Plan)))?;

    let mut vars = HashMap::new();
    vars.insert("spec_file".to_string(), spec.to_string());
    let prompt = stages::prompt::render(&template, &vars);

    let executor = OpencodeExecutor::new();
    let model = model.or(non_empty(&config.model));
    let result = executor
        .run_stage(Stage::Plan, &prompt, repo_root, config.stage_timeout_ms, model, agent)
        .await
        .context("failed to run opencode for the PLAN stage")?;

    if result.timed_out {
        anyhow::bail!("PLAN stage timed out after {}ms", config.stage_timeout_ms);
    }

    let output = reconcile::extract_structured_output(&result.output)
        .ok_or_else(|| anyhow::anyhow!("agent output did not contain a structured PLAN result"))?;

    let store = TixClient::new(repo_root);
    let reconciled = reconcile::reconcile_plan(&store, &output, spec).await;
    println!("{}", reconciled.summary());
    for error in &reconciled.errors {
        eprintln!("warning: {error}");
    }

    let state = orch_state::load(&paths.state_path);
    if state.spec.as_deref() != Some(spec) {
        orch_state::save(&paths.state_path, &OrchestrationState::new(spec.to_string()))
            .with_context(|| format!("failed to write {}", paths.state_path.display()))?;
    }

    if !reconciled.ok {
        anyhow::bail!("PLAN stage reconciliation reported errors");
    }
    Ok(())
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
