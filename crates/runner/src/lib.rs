//! Runner side of the build farm.
//!
//! A runner receives [`BuildJob`]s from the master, runs them one at a time
//! through a [`BuildQueue`], invokes the project's engine and uploads the
//! output directory back.
//!
//! [`BuildJob`]: buildfarm_protocol::BuildJob

mod executor;
mod invoke;
mod queue;
mod service;

pub use executor::JobExecutor;
pub use invoke::{
    BuildFuture, BuildInvoker, BuildOutcome, EngineInvoker, GodotInvoker, TargetConfig,
    UnityInvoker, output_tail,
};
pub use queue::{BuildQueue, JobHandler, QueueState};
pub use service::{BuildRunnerService, RunnerInfoService};

use buildfarm_workspace::EngineKind;

/// Lines of build output kept as diagnostic text.
pub const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Errors produced while running a job.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workspace error: {0}")]
    Workspace(#[from] buildfarm_workspace::WorkspaceError),

    #[error("transfer error: {0}")]
    Transfer(#[from] buildfarm_transfer::TransferError),

    #[error("send failed: {0}")]
    Send(#[from] buildfarm_socket::SendError),

    #[error("no configuration for target {0}")]
    UnknownTarget(String),

    #[error("target {target} has no {setting} setting")]
    MissingTargetSetting { target: String, setting: &'static str },

    #[error("no {0} executable configured on this runner")]
    EngineNotConfigured(EngineKind),

    #[error("target {target} builds on {required}, this runner is {actual}")]
    WrongOs {
        target: String,
        required: buildfarm_protocol::OsFamily,
        actual: buildfarm_protocol::OsFamily,
    },

    #[error("runner is shutting down")]
    ShuttingDown,
}
