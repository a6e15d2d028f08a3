//! Git integration: branch/commit queries and the sync-then-push dance used
//! to serialize plan-file updates across collaborators without a shared
//! database.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);
const NETWORK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated,
    Current,
    Conflict,
    Error,
}

async fn run_git(cwd: &Path, args: &[&str], timeout: Duration) -> Option<(bool, String, String)> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().ok()?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .ok()?
        .ok()?;
    Some((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}

pub async fn current_commit(cwd: &Path) -> String {
    match run_git(cwd, &["rev-parse", "--short", "HEAD"], LOCAL_TIMEOUT).await {
        Some((true, stdout, _)) if !stdout.is_empty() => stdout,
        _ => "unknown".to_string(),
    }
}

pub async fn current_branch(cwd: &Path) -> String {
    match run_git(cwd, &["branch", "--show-current"], LOCAL_TIMEOUT).await {
        Some((true, stdout, _)) if !stdout.is_empty() => stdout,
        _ => "unknown".to_string(),
    }
}

pub async fn has_uncommitted_plan(plan_file: &Path, cwd: &Path) -> bool {
    let plan_str = plan_file.to_string_lossy().to_string();
    match run_git(cwd, &["status", "--porcelain", &plan_str], LOCAL_TIMEOUT).await {
        Some((true, stdout, _)) => !stdout.is_empty(),
        _ => false,
    }
}

async fn commit_plan_if_modified(plan_file: &Path, cwd: &Path, commit_prefix: &str) {
    if !has_uncommitted_plan(plan_file, cwd).await {
        return;
    }
    let plan_str = plan_file.to_string_lossy().to_string();
    let _ = run_git(cwd, &["add", &plan_str], LOCAL_TIMEOUT).await;
    let message = format!("{commit_prefix} save state before sync");
    let _ = run_git(cwd, &["commit", "-m", &message], LOCAL_TIMEOUT).await;
}

async fn fetch_remote(branch: &str, cwd: &Path) -> bool {
    matches!(
        run_git(cwd, &["fetch", "origin", branch], NETWORK_TIMEOUT).await,
        Some((true, _, _))
    )
}

async fn is_branch_behind(cwd: &Path) -> bool {
    match run_git(cwd, &["status", "-uno"], LOCAL_TIMEOUT).await {
        Some((true, stdout, _)) => {
            stdout.contains("Your branch is behind") || stdout.contains("have diverged")
        }
        _ => false,
    }
}

async fn rebase_onto_remote(branch: &str, cwd: &Path) -> SyncOutcome {
    let remote_ref = format!("origin/{branch}");
    match run_git(cwd, &["rebase", &remote_ref], NETWORK_TIMEOUT).await {
        Some((true, _, _)) => SyncOutcome::Updated,
        Some((false, stdout, stderr)) => {
            let _ = run_git(cwd, &["rebase", "--abort"], LOCAL_TIMEOUT).await;
            if stdout.contains("CONFLICT") || stderr.to_lowercase().contains("conflict") {
                SyncOutcome::Conflict
            } else {
                SyncOutcome::Error
            }
        }
        None => {
            let _ = run_git(cwd, &["rebase", "--abort"], LOCAL_TIMEOUT).await;
            SyncOutcome::Error
        }
    }
}

/// Bring the local branch up to date with its remote. Commits the plan
/// file first if it has uncommitted changes, so the rebase carries it
/// along rather than dropping it.
pub async fn sync_with_remote(
    branch: Option<&str>,
    plan_file: &Path,
    cwd: &Path,
    commit_prefix: &str,
) -> SyncOutcome {
    let branch = match branch {
        Some(b) => b.to_string(),
        None => current_branch(cwd).await,
    };
    if branch == "unknown" {
        return SyncOutcome::Error;
    }

    commit_plan_if_modified(plan_file, cwd, commit_prefix).await;

    if !fetch_remote(&branch, cwd).await {
        return SyncOutcome::Error;
    }
    if !is_branch_behind(cwd).await {
        return SyncOutcome::Current;
    }
    rebase_onto_remote(&branch, cwd).await
}

/// Push, retrying through a sync-with-remote cycle if the push is rejected
/// for being non-fast-forward. Any other push failure returns immediately.
pub async fn push_with_retry(
    branch: &str,
    retries: u32,
    plan_file: &Path,
    cwd: &Path,
    commit_prefix: &str,
) -> bool {
    for _ in 0..retries.max(1) {
        match run_git(cwd, &["push", "origin", branch], NETWORK_TIMEOUT).await {
            Some((true, _, _)) => return true,
            Some((false, _, stderr)) => {
                let lower = stderr.to_lowercase();
                if lower.contains("rejected") || lower.contains("non-fast-forward") {
                    match sync_with_remote(Some(branch), plan_file, cwd, commit_prefix).await {
                        SyncOutcome::Conflict | SyncOutcome::Error => return false,
                        _ => continue,
                    }
                }
                return false;
            }
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        dir
    }

    #[tokio::test]
    async fn current_commit_returns_short_sha_in_real_repo() {
        let repo = init_repo();
        let sha = current_commit(repo.path()).await;
        assert_ne!(sha, "unknown");
        assert!(sha.len() >= 7);
    }

    #[tokio::test]
    async fn current_commit_is_unknown_outside_a_repo() {
        let dir = TempDir::new().unwrap();
        let sha = current_commit(dir.path()).await;
        assert_eq!(sha, "unknown");
    }

    #[tokio::test]
    async fn current_branch_returns_non_unknown_in_real_repo() {
        let repo = init_repo();
        let branch = current_branch(repo.path()).await;
        assert_ne!(branch, "unknown");
    }

    #[tokio::test]
    async fn has_uncommitted_plan_detects_modified_file() {
        let repo = init_repo();
        let plan = repo.path().join("plan.jsonl");
        std::fs::write(&plan, "{}\n").unwrap();
        assert!(has_uncommitted_plan(&plan, repo.path()).await);
    }

    #[tokio::test]
    async fn has_uncommitted_plan_false_for_committed_file() {
        let repo = init_repo();
        let plan = repo.path().join("README.md");
        assert!(!has_uncommitted_plan(&plan, repo.path()).await);
    }

    #[tokio::test]
    async fn sync_with_remote_errors_without_a_configured_remote() {
        let repo = init_repo();
        let plan = repo.path().join("plan.jsonl");
        let outcome = sync_with_remote(None, &plan, repo.path(), "ralph:").await;
        assert_eq!(outcome, SyncOutcome::Error);
    }
}
