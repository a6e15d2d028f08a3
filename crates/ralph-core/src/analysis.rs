//! Rejection pattern analysis: advisory-only clustering of reject-tombstone
//! reasons into suggested follow-up issues for the reporting surface
//! (`ralph log` / `ralph compare`). This module never mutates the ticket
//! store on its own.

use std::collections::HashMap;

use crate::ids::gen_id;
use crate::model::{Issue, Tombstone};

const PATTERN_KEYWORDS: &[&str] = &[
    "argument count",
    "not found",
    "grep returns 0",
    "expected 1",
    "expected 0",
    "times out",
    "timeout",
    "still contains",
    "not implemented",
    "missing",
];
const REJECTION_THRESHOLD: usize = 3;
const PATTERN_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternAnalysis {
    /// Task IDs rejected at least [`REJECTION_THRESHOLD`] times.
    pub repeated_tasks: Vec<String>,
    /// Keywords matching at least [`PATTERN_THRESHOLD`] distinct tasks,
    /// with the (task_id, reason) pairs that matched.
    pub common_patterns: Vec<(String, Vec<(String, String)>)>,
}

pub fn analyze_rejection_patterns(tombstones: &[Tombstone]) -> PatternAnalysis {
    let mut rejections_by_task: HashMap<String, Vec<String>> = HashMap::new();
    let mut by_keyword: HashMap<&'static str, Vec<(String, String)>> = HashMap::new();

    for tomb in tombstones {
        rejections_by_task
            .entry(tomb.id.clone())
            .or_default()
            .push(tomb.reason.clone());

        let lower = tomb.reason.to_lowercase();
        // First matching keyword wins, mirroring the source's break-on-match loop.
        if let Some(keyword) = PATTERN_KEYWORDS.iter().find(|kw| lower.contains(*kw)) {
            by_keyword
                .entry(keyword)
                .or_default()
                .push((tomb.id.clone(), tomb.reason.clone()));
        }
    }

    let mut repeated_tasks: Vec<String> = rejections_by_task
        .iter()
        .filter(|(_, reasons)| reasons.len() >= REJECTION_THRESHOLD)
        .map(|(id, _)| id.clone())
        .collect();
    repeated_tasks.sort();

    let mut common_patterns: Vec<(String, Vec<(String, String)>)> = by_keyword
        .into_iter()
        .filter(|(_, hits)| {
            let distinct_tasks: std::collections::HashSet<&str> =
                hits.iter().map(|(id, _)| id.as_str()).collect();
            distinct_tasks.len() >= PATTERN_THRESHOLD
        })
        .map(|(kw, hits)| (kw.to_string(), hits))
        .collect();
    common_patterns.sort_by(|a, b| a.0.cmp(&b.0));

    PatternAnalysis {
        repeated_tasks,
        common_patterns,
    }
}

/// Synthesize new issues from a pattern analysis, skipping descriptions
/// already present (case-insensitive) among `existing_issues`.
pub fn suggest_issues(patterns: &PatternAnalysis, spec_file: &str, existing_issues: &[Issue]) -> Vec<Issue> {
    let existing_descs: std::collections::HashSet<String> = existing_issues
        .iter()
        .map(|i| i.desc.to_lowercase())
        .collect();

    let mut suggestions = Vec::new();

    for task_id in &patterns.repeated_tasks {
        let desc = format!("task {task_id} has been rejected repeatedly; needs investigation");
        if !existing_descs.contains(&desc.to_lowercase()) {
            suggestions.push(Issue::new(gen_id("i"), desc, spec_file));
        }
    }

    for (keyword, hits) in &patterns.common_patterns {
        let distinct_tasks: std::collections::HashSet<&str> =
            hits.iter().map(|(id, _)| id.as_str()).collect();
        let desc = format!(
            "recurring failure pattern \"{keyword}\" seen across {} tasks",
            distinct_tasks.len()
        );
        if !existing_descs.contains(&desc.to_lowercase()) {
            suggestions.push(Issue::new(gen_id("i"), desc, spec_file));
        }
    }

    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject(id: &str, reason: &str) -> Tombstone {
        Tombstone::reject(id, "2024-01-01T00:00:00Z", reason)
    }

    #[test]
    fn repeated_task_needs_three_rejections() {
        let tombs = vec![reject("t-1", "a"), reject("t-1", "b")];
        let analysis = analyze_rejection_patterns(&tombs);
        assert!(analysis.repeated_tasks.is_empty());

        let tombs = vec![reject("t-1", "a"), reject("t-1", "b"), reject("t-1", "c")];
        let analysis = analyze_rejection_patterns(&tombs);
        assert_eq!(analysis.repeated_tasks, vec!["t-1".to_string()]);
    }

    #[test]
    fn common_pattern_needs_two_distinct_tasks() {
        let tombs = vec![
            reject("t-1", "function not found in module"),
            reject("t-2", "symbol not found anywhere"),
        ];
        let analysis = analyze_rejection_patterns(&tombs);
        assert_eq!(analysis.common_patterns.len(), 1);
        assert_eq!(analysis.common_patterns[0].0, "not found");
    }

    #[test]
    fn common_pattern_ignores_single_task_repeats() {
        let tombs = vec![
            reject("t-1", "times out after 5s"),
            reject("t-1", "still times out"),
        ];
        let analysis = analyze_rejection_patterns(&tombs);
        assert!(analysis.common_patterns.is_empty());
    }

    #[test]
    fn suggest_issues_skips_existing_descriptions_case_insensitively() {
        let tombs = vec![reject("t-1", "a"), reject("t-1", "b"), reject("t-1", "c")];
        let analysis = analyze_rejection_patterns(&tombs);
        let existing = vec![Issue::new(
            "i-1",
            "TASK T-1 HAS BEEN REJECTED REPEATEDLY; NEEDS INVESTIGATION",
            "s.md",
        )];
        let suggestions = suggest_issues(&analysis, "s.md", &existing);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn suggest_issues_creates_new_issue_for_repeated_task() {
        let tombs = vec![reject("t-1", "a"), reject("t-1", "b"), reject("t-1", "c")];
        let analysis = analyze_rejection_patterns(&tombs);
        let suggestions = suggest_issues(&analysis, "s.md", &[]);
        assert_eq!(suggestions.len(), 1);
        assert!(suggestions[0].desc.contains("t-1"));
    }
}
