//! Outstanding jobs and the waiters blocked on them.
//!
//! A job resolves once its runner reported `Complete` and the upload
//! summary for its directory verified. The two arrive on different services
//! and may be handled in either order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use buildfarm_pipeline::{CollaboratorError, TargetResult};
use buildfarm_protocol::{BuildJob, BuildStatus, BuildStatusMessage};
use buildfarm_socket::ConnectionId;
use tokio::sync::oneshot;

pub type JobOutcome = Result<TargetResult, CollaboratorError>;

struct PendingJob {
    connection_id: ConnectionId,
    runner: String,
    target: String,
    directory: String,
    build_time_ms: Option<i64>,
    completed: bool,
    artifacts: Option<PathBuf>,
    done: oneshot::Sender<JobOutcome>,
}

#[derive(Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, PendingJob>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `job` on the runner behind `connection_id`.
    pub fn register(&self, job: &BuildJob, connection_id: ConnectionId, runner: &str) -> oneshot::Receiver<JobOutcome> {
        let (done, rx) = oneshot::channel();
        self.lock().insert(
            job.job_id.clone(),
            PendingJob {
                connection_id,
                runner: runner.to_string(),
                target: job.target_name.clone(),
                directory: job.upload_directory(),
                build_time_ms: None,
                completed: false,
                artifacts: None,
                done,
            },
        );
        rx
    }

    /// Stops tracking a job without resolving it.
    pub fn forget(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    /// Applies a status report from `connection_id`.
    ///
    /// Reports without a job id are matched by target name on that
    /// connection.
    pub fn status(&self, connection_id: ConnectionId, message: &BuildStatusMessage) {
        let mut jobs = self.lock();
        let job_id = match &message.job_id {
            Some(id) => Some(id.clone()),
            None => jobs
                .iter()
                .find(|(_, j)| j.connection_id == connection_id && j.target == message.target_name)
                .map(|(id, _)| id.clone()),
        };
        let Some(job_id) = job_id else {
            tracing::debug!(connection_id, target = %message.target_name, "status for unknown job ignored");
            return;
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            tracing::debug!(connection_id, job = %job_id, "status for unknown job ignored");
            return;
        };

        match message.status {
            BuildStatus::Queued | BuildStatus::Building => {
                tracing::info!(job = %job_id, target = %job.target, status = ?message.status, "job progress");
            }
            BuildStatus::Complete => {
                job.completed = true;
                job.build_time_ms = message.time;
                tracing::info!(job = %job_id, target = %job.target, time_ms = ?message.time, "build complete, awaiting artifacts");
                if job.artifacts.is_some() {
                    Self::resolve(&mut jobs, &job_id);
                }
            }
            BuildStatus::Error => {
                let text = message.message.clone().unwrap_or_else(|| "build failed".into());
                if let Some(job) = jobs.remove(&job_id) {
                    tracing::warn!(job = %job_id, target = %job.target, "build failed on runner");
                    let _ = job.done.send(Err(CollaboratorError::Failed(text)));
                }
            }
        }
    }

    /// Records the outcome of an upload summary.
    ///
    /// Summaries without a job id are matched by upload directory.
    pub fn artifacts(&self, job_id: Option<&str>, directory: &str, result: Result<PathBuf, String>) {
        let mut jobs = self.lock();
        let job_id = match job_id {
            Some(id) => Some(id.to_string()),
            None => jobs
                .iter()
                .find(|(_, j)| j.directory == directory)
                .map(|(id, _)| id.clone()),
        };
        let Some(job_id) = job_id.filter(|id| jobs.contains_key(id)) else {
            tracing::debug!(%directory, "upload for unknown job ignored");
            return;
        };

        match result {
            Ok(path) => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.artifacts = Some(path);
                    if job.completed {
                        Self::resolve(&mut jobs, &job_id);
                    }
                }
            }
            Err(reason) => {
                if let Some(job) = jobs.remove(&job_id) {
                    tracing::warn!(job = %job_id, %directory, "artifact verification failed: {reason}");
                    let _ = job
                        .done
                        .send(Err(CollaboratorError::Failed(format!("artifact upload failed: {reason}"))));
                }
            }
        }
    }

    /// Fails every job running on a connection that went away.
    pub fn fail_connection(&self, connection_id: ConnectionId) -> usize {
        let mut jobs = self.lock();
        let lost: Vec<String> = jobs
            .iter()
            .filter(|(_, j)| j.connection_id == connection_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lost {
            if let Some(job) = jobs.remove(id) {
                tracing::warn!(job = %id, target = %job.target, runner = %job.runner, "runner disconnected mid-job");
                let _ = job.done.send(Err(CollaboratorError::Disconnected));
            }
        }
        lost.len()
    }

    fn resolve(jobs: &mut HashMap<String, PendingJob>, job_id: &str) {
        if let Some(job) = jobs.remove(job_id) {
            tracing::info!(job = %job_id, target = %job.target, runner = %job.runner, "job resolved");
            let _ = job.done.send(Ok(TargetResult {
                runner: job.runner,
                build_time_ms: job.build_time_ms,
                artifact_path: job.artifacts,
            }));
        }
    }
}
