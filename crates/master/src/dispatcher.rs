use std::sync::Arc;

use buildfarm_pipeline::{CollaboratorError, CollaboratorFuture, TargetDispatcher, TargetResult};
use buildfarm_protocol::BuildJob;
use tokio_util::sync::CancellationToken;

use crate::jobs::JobTracker;
use crate::registry::RunnerRegistry;

/// Forgets a job if the dispatch future is dropped before it resolves.
struct Registration<'a> {
    jobs: &'a JobTracker,
    job_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.jobs.forget(&self.job_id);
    }
}

/// Sends jobs over the `build-runner` service of a matching runner's
/// connection and waits for the tracker to resolve them.
pub struct SocketDispatcher {
    runners: Arc<RunnerRegistry>,
    jobs: Arc<JobTracker>,
}

impl SocketDispatcher {
    pub fn new(runners: Arc<RunnerRegistry>, jobs: Arc<JobTracker>) -> Self {
        Self { runners, jobs }
    }
}

impl TargetDispatcher for SocketDispatcher {
    fn dispatch(&self, job: BuildJob, cancel: CancellationToken) -> CollaboratorFuture<'_, TargetResult> {
        Box::pin(async move {
            let runner = self
                .runners
                .select(&job.target_name)
                .await
                .ok_or_else(|| CollaboratorError::NoRunner(job.target_name.clone()))?;

            let done = self.jobs.register(&job, runner.connection_id, &runner.info.name);
            let _registration = Registration {
                jobs: &self.jobs,
                job_id: job.job_id.clone(),
            };

            tracing::info!(
                job = %job.job_id,
                target = %job.target_name,
                runner = %runner.info.name,
                connection_id = runner.connection_id,
                "job sent to runner"
            );
            runner
                .jobs
                .send_json(&job)
                .await
                .map_err(|_| CollaboratorError::Disconnected)?;

            tokio::select! {
                _ = cancel.cancelled() => Err(CollaboratorError::Cancelled),
                outcome = done => outcome.unwrap_or(Err(CollaboratorError::Disconnected)),
            }
        })
    }
}
