//! Scheduling helpers: which pending task runs next, whether an acceptance
//! string looks like a runnable shell command, and issue deduplication by
//! description similarity.

use std::collections::{HashMap, HashSet};

use crate::model::{Issue, Priority, Task};

/// Pick the next task to run. Ready tasks (all deps already completed) sort
/// before blocked ones; ties break on priority, then retry count, then
/// input order. If every task is blocked, the first by (priority, retry,
/// order) is still returned — a planning problem should surface quickly
/// rather than stall silently.
pub fn pick_best_task<'a>(
    pending: &'a [Task],
    completed_ids: &HashSet<String>,
    retry_counts: &HashMap<String, u32>,
) -> Option<&'a Task> {
    pending.iter().enumerate().min_by_key(|(order, task)| {
        let blocked = !task.deps_satisfied(completed_ids);
        let priority_rank = Priority::rank(task.priority);
        let retries = retry_counts.get(&task.id).copied().unwrap_or(0);
        (blocked, priority_rank, retries, *order)
    }).map(|(_, task)| task)
}

const COMMAND_PREFIXES: &[&str] = &[
    "pytest", "make", "go", "npm", "cargo", "./", "bash", "sh", "python", "grep", "test", "echo",
];
const COMMAND_INFIX_TOKENS: &[&str] = &["|", "&&", "||", ">>", ">", ";"];

/// True iff `accept` looks like a runnable shell command rather than prose.
pub fn looks_like_command(accept: &str) -> bool {
    let trimmed = accept.trim();
    if trimmed.is_empty() {
        return false;
    }
    if COMMAND_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return true;
    }
    COMMAND_INFIX_TOKENS.iter().any(|tok| trimmed.contains(tok))
}

fn canonicalize(desc: &str) -> HashSet<String> {
    desc.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Return the IDs of issues that are near-duplicates of an earlier issue in
/// the input (input order preserved: the earliest occurrence of a cluster
/// is kept, later members are reported as duplicates). `threshold` of
/// `1.0` disables fuzzy matching — only exact-after-canonicalization
/// duplicates are reported.
pub fn find_duplicate_issues(issues: &[Issue], threshold: f64) -> Vec<String> {
    let canon: Vec<HashSet<String>> = issues.iter().map(|i| canonicalize(&i.desc)).collect();
    let mut duplicates = Vec::new();
    let mut dropped = HashSet::new();

    for i in 0..issues.len() {
        if dropped.contains(&i) {
            continue;
        }
        for j in (i + 1)..issues.len() {
            if dropped.contains(&j) {
                continue;
            }
            let similarity = jaccard(&canon[i], &canon[j]);
            let is_duplicate = if threshold >= 1.0 {
                canon[i] == canon[j]
            } else {
                similarity >= threshold
            };
            if is_duplicate {
                dropped.insert(j);
                duplicates.push(issues[j].id.clone());
            }
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: Option<Priority>, deps: Option<Vec<&str>>) -> Task {
        let mut t = Task::new(id, "n", "s.md");
        t.priority = priority;
        t.deps = deps.map(|d| d.into_iter().map(str::to_string).collect());
        t
    }

    #[test]
    fn pick_best_task_prefers_ready_over_blocked() {
        let pending = vec![
            task("t-1", None, Some(vec!["t-missing"])),
            task("t-2", None, None),
        ];
        let completed = HashSet::new();
        let retries = HashMap::new();
        let chosen = pick_best_task(&pending, &completed, &retries).unwrap();
        assert_eq!(chosen.id, "t-2");
    }

    #[test]
    fn pick_best_task_prefers_high_priority_among_ready() {
        let pending = vec![
            task("t-1", Some(Priority::Low), None),
            task("t-2", Some(Priority::High), None),
        ];
        let completed = HashSet::new();
        let retries = HashMap::new();
        let chosen = pick_best_task(&pending, &completed, &retries).unwrap();
        assert_eq!(chosen.id, "t-2");
    }

    #[test]
    fn pick_best_task_prefers_fewer_retries() {
        let pending = vec![task("t-1", None, None), task("t-2", None, None)];
        let completed = HashSet::new();
        let mut retries = HashMap::new();
        retries.insert("t-1".to_string(), 3);
        let chosen = pick_best_task(&pending, &completed, &retries).unwrap();
        assert_eq!(chosen.id, "t-2");
    }

    #[test]
    fn pick_best_task_falls_back_to_input_order_when_all_blocked() {
        let pending = vec![
            task("t-1", None, Some(vec!["t-missing"])),
            task("t-2", None, Some(vec!["t-also-missing"])),
        ];
        let completed = HashSet::new();
        let retries = HashMap::new();
        let chosen = pick_best_task(&pending, &completed, &retries).unwrap();
        assert_eq!(chosen.id, "t-1");
    }

    #[test]
    fn looks_like_command_recognizes_known_prefixes() {
        assert!(looks_like_command("pytest tests/"));
        assert!(looks_like_command("cargo test"));
        assert!(looks_like_command("./run.sh"));
    }

    #[test]
    fn looks_like_command_recognizes_shell_operators() {
        assert!(looks_like_command("foo | grep bar"));
        assert!(looks_like_command("a && b"));
    }

    #[test]
    fn looks_like_command_rejects_prose() {
        assert!(!looks_like_command("the feature should work correctly"));
        assert!(!looks_like_command(""));
    }

    #[test]
    fn find_duplicate_issues_detects_near_identical_descriptions() {
        let issues = vec![
            Issue::new("i-1", "login page crashes on submit", "s.md"),
            Issue::new("i-2", "login page crashes on submit button", "s.md"),
            Issue::new("i-3", "totally unrelated issue", "s.md"),
        ];
        let dupes = find_duplicate_issues(&issues, 0.6);
        assert_eq!(dupes, vec!["i-2".to_string()]);
    }

    #[test]
    fn find_duplicate_issues_threshold_one_requires_exact_match() {
        let issues = vec![
            Issue::new("i-1", "same text", "s.md"),
            Issue::new("i-2", "same text", "s.md"),
            Issue::new("i-3", "same text almost", "s.md"),
        ];
        let dupes = find_duplicate_issues(&issues, 1.0);
        assert_eq!(dupes, vec!["i-2".to_string()]);
    }
}
