//! `ralph compare`: summarize rejection patterns from the bootstrap plan
//! file and suggest follow-up issues.

use std::path::Path;

use ralph_core::analysis;

use crate::paths::Paths;

pub fn run(
    repo_root: &Path,
    spec: Option<String>,
    profile: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(profile) = &profile {
        std::env::set_var("RALPH_PROFILE", profile);
    }
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);

    let plan = ralph_core::plan_file::load(&paths.plan_path);
    let spec_file = spec.unwrap_or_else(|| plan.spec.clone().unwrap_or_default());

    let patterns = analysis::analyze_rejection_patterns(&plan.rejected);
    let suggestions = analysis::suggest_issues(&patterns, &spec_file, &plan.issues);

    if json {
        let value = serde_json::json!({
            "repeated_tasks": patterns.repeated_tasks,
            "common_patterns": patterns.common_patterns,
            "suggested_issues": suggestions.iter().map(|i| &i.desc).collect::<Vec<_>>(),
        });
        println!("{value}");
        return Ok(());
    }

    if patterns.repeated_tasks.is_empty() {
        println!("no repeated rejections found");
    } else {
        println!("tasks rejected more than once:");
        for id in &patterns.repeated_tasks {
            println!("  {id}");
        }
    }

    for (pattern, examples) in &patterns.common_patterns {
        println!("pattern: {pattern} ({} occurrences)", examples.len());
    }

    if suggestions.is_empty() {
        println!("no new issues suggested");
    } else {
        println!("suggested issues:");
        for issue in &suggestions {
            println!("  {}", issue.desc);
        }
    }
    Ok(())
}
