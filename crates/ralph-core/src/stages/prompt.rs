//! Prompt template loading and placeholder substitution.
//!
//! Substitution is a plain string-replace pass over `{{key}}` tokens — no
//! templating engine, matching the source's treatment of prompts as data.

use std::collections::HashMap;
use std::path::Path;

/// Render a template by replacing every `{{key}}` occurrence with its
/// value. Keys with no matching placeholder are ignored; placeholders with
/// no matching key are left verbatim.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
}

/// Load a stage's prompt template from the prompts directory, plus
/// project-local rules files (`AGENTS.md`, `CLAUDE.md`) if present, appended
/// after the template.
pub fn load_with_project_rules(prompts_dir: &Path, filename: &str, repo_root: &Path) -> std::io::Result<String> {
    let mut template = std::fs::read_to_string(prompts_dir.join(filename))?;
    for rules_file in ["AGENTS.md", "CLAUDE.md"] {
        if let Ok(rules) = std::fs::read_to_string(repo_root.join(rules_file)) {
            template.push_str("\n\n## Project rules (");
            template.push_str(rules_file);
            template.push_str(")\n\n");
            template.push_str(&rules);
        }
    }
    Ok(template)
}
