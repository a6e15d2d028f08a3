//! `ralph init`: scaffold the ralph directory for a repo.

use std::path::Path;

use anyhow::Context;

use crate::paths::Paths;

const PROMPT_PLAN: &str = r#"You are planning implementation work for {{spec_file}}.

Read the spec and break it into an initial set of tasks. Each task needs a
name, an acceptance criterion, and (if relevant) dependencies on other tasks
by ID.

Respond with a structured output block:

[RALPH_OUTPUT]
{
  "tasks": [
    {"name": "...", "accept": "...", "notes": "...", "deps": [], "priority": "medium"}
  ],
  "drop": []
}
[/RALPH_OUTPUT]

`drop` lists IDs of previously planned tasks that no longer apply.
"#;

const PROMPT_INVESTIGATE: &str = r#"You are investigating open issues against {{spec_file}}.

Issues to resolve: {{issue_ids}}

For each issue, decide whether it needs a new task or can be dismissed.
Respond with a structured output block:

[RALPH_OUTPUT]
{
  "results": [
    {"issue_id": "...", "resolution": "task", "task": {"name": "...", "accept": "..."}}
  ]
}
[/RALPH_OUTPUT]

Use `"resolution": "dismiss"` (and omit `task`) for issues that need no work.
Every issue_id you were given must appear exactly once in `results`.
"#;

const PROMPT_BUILD: &str = r#"You are implementing a task against {{spec_file}}.

Task: {{task_name}}
Acceptance: {{task_spec}}
Notes: {{task_notes}}
Previous rejection reason: {{previous_reject_reason}}

Make the change, then respond with a structured output block:

[RALPH_OUTPUT]
{
  "verdict": "done",
  "issues": []
}
[/RALPH_OUTPUT]

Use `"verdict": "blocked"` plus a `"reason"` field if you cannot complete the
task. List any newly discovered problems under `issues` as `{"desc": "..."}`.
"#;

const PROMPT_VERIFY: &str = r#"Verify the following completed tasks: {{task_ids}}

For each, check that its acceptance criterion actually holds. Respond with a
structured output block:

[RALPH_OUTPUT]
{
  "results": [
    {"task_id": "...", "passed": true}
  ]
}
[/RALPH_OUTPUT]

For a failing task, set `"passed": false` and include a `"reason"` (or
`"evidence"`) field explaining why.
"#;

const PROMPT_DECOMPOSE: &str = r#"Task {{task_name}} failed and needs to be broken down.

Reason: {{kill_reason}}

Recent failure log:
{{kill_log}}

Split this task into smaller subtasks that together accomplish the same
goal. Respond with a structured output block:

[RALPH_OUTPUT]
{
  "subtasks": [
    {"name": "...", "accept": "..."}
  ]
}
[/RALPH_OUTPUT]
"#;

fn write_if_absent(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

pub fn run(repo_root: &Path) -> anyhow::Result<()> {
    let config = ralph_core::config::load();
    let paths = Paths::resolve(repo_root, &config);

    std::fs::create_dir_all(&paths.ralph_dir)
        .with_context(|| format!("failed to create {}", paths.ralph_dir.display()))?;
    std::fs::create_dir_all(&paths.specs_dir)
        .with_context(|| format!("failed to create {}", paths.specs_dir.display()))?;

    write_if_absent(&paths.ralph_dir.join("PROMPT_PLAN.md"), PROMPT_PLAN)?;
    write_if_absent(&paths.ralph_dir.join("PROMPT_INVESTIGATE.md"), PROMPT_INVESTIGATE)?;
    write_if_absent(&paths.ralph_dir.join("PROMPT_BUILD.md"), PROMPT_BUILD)?;
    write_if_absent(&paths.ralph_dir.join("PROMPT_VERIFY.md"), PROMPT_VERIFY)?;
    write_if_absent(&paths.ralph_dir.join("PROMPT_DECOMPOSE.md"), PROMPT_DECOMPOSE)?;

    if !paths.plan_path.exists() {
        ralph_core::plan_file::save(&paths.plan_path, &ralph_core::PlanFile::default())
            .with_context(|| format!("failed to write {}", paths.plan_path.display()))?;
    }

    println!("initialized ralph directory at {}", paths.ralph_dir.display());
    Ok(())
}
