//! Workspace collaborator: where a project lives on disk, which engine
//! builds it, and the version/changelog bookkeeping done before a build.

mod engine;
mod git;
mod local;
mod version;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use buildfarm_protocol::VersionBump;

pub use engine::{EngineKind, detect_engine};
pub use local::{CHANGELOG_ARCHIVE_FILE, CHANGELOG_PENDING_FILE, LocalWorkspace, VERSION_FILE};
pub use version::Version;

/// Errors produced by workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("unsupported project at {0}: no Unity or Godot markers")]
    UnsupportedEngine(PathBuf),

    #[error("invalid version {0:?}")]
    InvalidVersion(String),

    #[error("version {0} cannot be bumped any further")]
    VersionOverflow(String),

    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("invalid branch name: {0:?}")]
    InvalidBranch(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
}

/// A project checked out and ready to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWorkspace {
    pub project_id: String,
    pub branch: String,
    pub project_path: PathBuf,
    pub engine: EngineKind,
}

/// A boxed future returned by [`Workspace`] methods.
pub type WorkspaceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, WorkspaceError>> + Send + 'a>>;

/// Source of project checkouts.
///
/// Both the master (version bump, changelog) and every runner (checkout
/// before building) go through this trait, so tests swap in fakes.
pub trait Workspace: Send + Sync + 'static {
    /// Locates the project and switches it to `branch`.
    fn prepare<'a>(&'a self, project_id: &'a str, branch: &'a str) -> WorkspaceFuture<'a, PreparedWorkspace>;

    /// Pulls the latest revision of the prepared branch.
    fn update<'a>(&'a self, workspace: &'a PreparedWorkspace) -> WorkspaceFuture<'a, ()>;

    /// Applies `bump` and returns the new full version string.
    fn version_bump<'a>(&'a self, workspace: &'a PreparedWorkspace, bump: VersionBump) -> WorkspaceFuture<'a, String>;

    /// Changelog entries since the last successful build, oldest first.
    fn change_log<'a>(&'a self, workspace: &'a PreparedWorkspace) -> WorkspaceFuture<'a, Vec<String>>;

    /// Records that `version` shipped, so its entries leave the pending changelog.
    fn mark_released<'a>(&'a self, workspace: &'a PreparedWorkspace, version: &'a str) -> WorkspaceFuture<'a, ()> {
        let _ = (workspace, version);
        Box::pin(async { Ok(()) })
    }
}
