//! Filesystem-backed workspace rooted at a projects directory.

use std::path::{Path, PathBuf};

use buildfarm_protocol::VersionBump;

use crate::engine::detect_engine;
use crate::version::Version;
use crate::{PreparedWorkspace, Workspace, WorkspaceError, WorkspaceFuture, git};

/// Version file in the project root.
pub const VERSION_FILE: &str = "VERSION";
/// Changelog entries not yet shipped, one per line.
pub const CHANGELOG_PENDING_FILE: &str = "CHANGELOG.pending";
/// Released entries are appended here under a version heading.
pub const CHANGELOG_ARCHIVE_FILE: &str = "CHANGELOG.md";

/// Projects live in `<projects_root>/<project_id>`.
///
/// Git checkouts are switched to the requested branch and pulled on
/// update; plain directories are used as they are.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    projects_root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    async fn do_prepare(&self, project_id: &str, branch: &str) -> Result<PreparedWorkspace, WorkspaceError> {
        validate_project_id(project_id)?;
        validate_branch(branch)?;
        let project_path = self.projects_root.join(project_id);
        if !tokio::fs::metadata(&project_path).await.is_ok_and(|m| m.is_dir()) {
            return Err(WorkspaceError::ProjectNotFound(project_id.to_string()));
        }

        if git::is_repository(&project_path) && git::current_branch(&project_path).await? != branch {
            tracing::info!(project = project_id, branch, "switching branch");
            git::run(&project_path, &["checkout", branch]).await?;
        }

        let engine = detect_engine(&project_path)
            .ok_or_else(|| WorkspaceError::UnsupportedEngine(project_path.clone()))?;

        tracing::debug!(project = project_id, %engine, path = %project_path.display(), "workspace prepared");
        Ok(PreparedWorkspace {
            project_id: project_id.to_string(),
            branch: branch.to_string(),
            project_path,
            engine,
        })
    }

    async fn do_version_bump(&self, ws: &PreparedWorkspace, bump: VersionBump) -> Result<String, WorkspaceError> {
        let path = ws.project_path.join(VERSION_FILE);
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.parse::<Version>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Version::default(),
            Err(e) => return Err(e.into()),
        };

        let next = current.bump(bump)?;
        if next != current {
            tokio::fs::write(&path, format!("{next}\n")).await?;
            tracing::info!(project = %ws.project_id, from = %current, to = %next, "version bumped");
        }
        Ok(next.to_string())
    }

    async fn do_change_log(&self, ws: &PreparedWorkspace) -> Result<Vec<String>, WorkspaceError> {
        let path = ws.project_path.join(CHANGELOG_PENDING_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn do_mark_released(&self, ws: &PreparedWorkspace, version: &str) -> Result<(), WorkspaceError> {
        let entries = self.do_change_log(ws).await?;
        if entries.is_empty() {
            return Ok(());
        }

        let archive = ws.project_path.join(CHANGELOG_ARCHIVE_FILE);
        let mut text = match tokio::fs::read_to_string(&archive).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!(
            "\n## {version} ({})\n\n",
            chrono::Local::now().format("%Y-%m-%d")
        ));
        for entry in &entries {
            text.push_str(&format!("- {entry}\n"));
        }

        tokio::fs::write(&archive, text).await?;
        tokio::fs::write(ws.project_path.join(CHANGELOG_PENDING_FILE), "").await?;
        Ok(())
    }
}

impl Workspace for LocalWorkspace {
    fn prepare<'a>(&'a self, project_id: &'a str, branch: &'a str) -> WorkspaceFuture<'a, PreparedWorkspace> {
        Box::pin(self.do_prepare(project_id, branch))
    }

    fn update<'a>(&'a self, workspace: &'a PreparedWorkspace) -> WorkspaceFuture<'a, ()> {
        Box::pin(async move {
            if git::is_repository(&workspace.project_path) {
                git::run(&workspace.project_path, &["pull", "--ff-only"]).await?;
            }
            Ok(())
        })
    }

    fn version_bump<'a>(&'a self, workspace: &'a PreparedWorkspace, bump: VersionBump) -> WorkspaceFuture<'a, String> {
        Box::pin(self.do_version_bump(workspace, bump))
    }

    fn change_log<'a>(&'a self, workspace: &'a PreparedWorkspace) -> WorkspaceFuture<'a, Vec<String>> {
        Box::pin(self.do_change_log(workspace))
    }

    fn mark_released<'a>(&'a self, workspace: &'a PreparedWorkspace, version: &'a str) -> WorkspaceFuture<'a, ()> {
        Box::pin(self.do_mark_released(workspace, version))
    }
}

fn validate_project_id(project_id: &str) -> Result<(), WorkspaceError> {
    let bad = project_id.is_empty()
        || project_id == "."
        || project_id == ".."
        || project_id.contains(['/', '\\', ':', '\0']);
    if bad {
        return Err(WorkspaceError::InvalidProjectId(project_id.to_string()));
    }
    Ok(())
}

/// Branch names reach `git checkout` as arguments, so anything git would
/// read as an option is refused.
fn validate_branch(branch: &str) -> Result<(), WorkspaceError> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(WorkspaceError::InvalidBranch(branch.to_string()));
    }
    Ok(())
}
