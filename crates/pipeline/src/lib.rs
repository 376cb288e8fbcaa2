//! Pipeline orchestration: one build request taken through
//! `PreBuild → Build → Deploy → PostBuild` with per-stage and per-target
//! status collected in a [`PipelineReport`].

mod collaborators;
mod orchestrator;
mod render;
mod report;

use std::time::Duration;

pub use collaborators::{
    CollaboratorFuture, CommandDeployer, DeployRequest, DeployTier, Deployer, LogNotifier,
    Notifier, TargetDispatcher, TargetResult,
};
pub use orchestrator::{DEFAULT_TARGET_TIMEOUT, Orchestrator, OrchestratorConfig};
pub use render::{format_duration, render_report};
pub use report::{DeployReport, PipelineReport, StageStatus, TargetReport};

/// Errors returned when a pipeline cannot be started.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("project {0} is already active")]
    AlreadyActive(String),

    #[error("no build targets requested")]
    NoTargets,

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// Failure reported by a collaborator (workspace, dispatcher, deployer,
/// notifier). Converted into report status, never propagated further.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workspace error: {0}")]
    Workspace(#[from] buildfarm_workspace::WorkspaceError),

    #[error("no runner available for target {0}")]
    NoRunner(String),

    #[error("runner disconnected")]
    Disconnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}
