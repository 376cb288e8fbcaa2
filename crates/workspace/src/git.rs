//! Thin wrappers over the `git` CLI.

use std::path::Path;

use crate::WorkspaceError;

/// Returns `true` if `path` is the root of a git checkout.
pub(crate) fn is_repository(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Runs `git -C <repo> <args>` and returns trimmed stdout.
pub(crate) async fn run(repo: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(WorkspaceError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub(crate) async fn current_branch(repo: &Path) -> Result<String, WorkspaceError> {
    run(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}
