//! Master side of the build farm.
//!
//! Wires the socket layer to the pipeline: runners announce themselves on
//! `runner-info`, receive jobs and report status on `build-runner`, and
//! upload artifacts on `file-transfer`; clients start pipelines on `build`.

mod artifacts;
mod dispatcher;
mod jobs;
mod registry;
mod requests;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use buildfarm_pipeline::Orchestrator;
use buildfarm_protocol::constants::{
    SERVICE_BUILD, SERVICE_BUILD_RUNNER, SERVICE_FILE_TRANSFER, SERVICE_RUNNER_INFO,
};
use buildfarm_socket::{ServiceRegistry, SocketError};
use tokio_util::task::TaskTracker;

pub use artifacts::ArtifactReceiver;
pub use dispatcher::SocketDispatcher;
pub use jobs::{JobOutcome, JobTracker};
pub use registry::{RunnerInfoService, RunnerRegistry, SelectedRunner, serves};
pub use requests::BuildRequestService;
pub use status::RunnerStatusService;

/// Shared master state: who is connected, which jobs are outstanding, and
/// where artifacts land.
pub struct Master {
    runners: Arc<RunnerRegistry>,
    jobs: Arc<JobTracker>,
    artifacts: Arc<ArtifactReceiver>,
    /// Pipelines started for clients, with their report delivery.
    tasks: TaskTracker,
}

impl Master {
    /// Artifacts are written under `receive_root/{project}/{target}`.
    pub fn new(receive_root: impl Into<PathBuf>) -> Self {
        let jobs = Arc::new(JobTracker::new());
        Self {
            runners: Arc::new(RunnerRegistry::new()),
            artifacts: Arc::new(ArtifactReceiver::new(receive_root, Arc::clone(&jobs))),
            jobs,
            tasks: TaskTracker::new(),
        }
    }

    /// Dispatcher for an [`Orchestrator`] that builds on this master's runners.
    pub fn dispatcher(&self) -> Arc<SocketDispatcher> {
        Arc::new(SocketDispatcher::new(
            Arc::clone(&self.runners),
            Arc::clone(&self.jobs),
        ))
    }

    pub fn runners(&self) -> &Arc<RunnerRegistry> {
        &self.runners
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn artifacts(&self) -> &Arc<ArtifactReceiver> {
        &self.artifacts
    }

    /// Number of pipelines whose report is not yet delivered.
    pub fn running_pipelines(&self) -> usize {
        self.tasks.len()
    }

    /// Stops accepting pipeline tasks and waits for the running ones.
    ///
    /// Pipelines end once the orchestrator's cancellation token fires.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// The master's service table.
    pub fn service_registry(&self, orchestrator: Arc<Orchestrator>) -> Result<ServiceRegistry, SocketError> {
        let mut registry = ServiceRegistry::new();
        registry.register(SERVICE_BUILD, Arc::new(BuildRequestService::new(orchestrator, self.tasks.clone())))?;
        registry.register(
            SERVICE_BUILD_RUNNER,
            Arc::new(RunnerStatusService::new(Arc::clone(&self.jobs))),
        )?;
        registry.register(
            SERVICE_RUNNER_INFO,
            Arc::new(RunnerInfoService::new(Arc::clone(&self.runners))),
        )?;
        registry.register(SERVICE_FILE_TRANSFER, self.artifacts.clone())?;
        Ok(registry)
    }
}
