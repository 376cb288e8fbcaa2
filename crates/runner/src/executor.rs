use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use buildfarm_protocol::constants::SERVICE_FILE_TRANSFER;
use buildfarm_protocol::{BuildJob, BuildStatus, BuildStatusMessage, OsFamily};
use buildfarm_socket::ServiceSender;
use buildfarm_transfer::upload_directory;
use buildfarm_workspace::Workspace;

use crate::invoke::{BuildInvoker, TargetConfig};
use crate::queue::JobHandler;
use crate::RunnerError;

/// Runs a dequeued job end to end: checkout, build, report, upload.
pub struct JobExecutor {
    os: OsFamily,
    workspace: Arc<dyn Workspace>,
    invoker: Arc<dyn BuildInvoker>,
    targets: HashMap<String, TargetConfig>,
    fragment_size: usize,
}

impl JobExecutor {
    pub fn new(
        os: OsFamily,
        workspace: Arc<dyn Workspace>,
        invoker: Arc<dyn BuildInvoker>,
        targets: impl IntoIterator<Item = TargetConfig>,
        fragment_size: usize,
    ) -> Self {
        Self {
            os,
            workspace,
            invoker,
            targets: targets.into_iter().map(|t| (t.name.clone(), t)).collect(),
            fragment_size,
        }
    }

    /// Names of the configured targets, sorted.
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    async fn run(&self, job: &BuildJob, reply: &ServiceSender) -> Result<(), RunnerError> {
        reply
            .send_json(&BuildStatusMessage::for_job(job, BuildStatus::Building))
            .await?;
        let started = Instant::now();

        let target = self
            .targets
            .get(&job.target_name)
            .ok_or_else(|| RunnerError::UnknownTarget(job.target_name.clone()))?;
        if let Some(required) = target.os
            && required != self.os
        {
            return Err(RunnerError::WrongOs {
                target: target.name.clone(),
                required,
                actual: self.os,
            });
        }

        let workspace = self.workspace.prepare(&job.project_id, &job.branch).await?;
        self.workspace.update(&workspace).await?;

        let outcome = self.invoker.build(&workspace, target).await?;
        let elapsed = started.elapsed().as_millis() as i64;

        if !outcome.succeeded() {
            tracing::warn!(job = %job.job_id, exit_code = outcome.exit_code, "build failed");
            let message = format!("exit code {}\n{}", outcome.exit_code, outcome.diagnostic);
            reply
                .send_json(
                    &BuildStatusMessage::for_job(job, BuildStatus::Error)
                        .with_time(elapsed)
                        .with_message(message),
                )
                .await?;
            return Ok(());
        }

        reply
            .send_json(&BuildStatusMessage::for_job(job, BuildStatus::Complete).with_time(elapsed))
            .await?;

        let files = reply.frames().service(SERVICE_FILE_TRANSFER);
        upload_directory(
            &files,
            &job.upload_directory(),
            &outcome.output_directory,
            self.fragment_size,
            Some(job.job_id.clone()),
        )
        .await?;
        Ok(())
    }
}

impl JobHandler for JobExecutor {
    fn handle(&self, job: BuildJob, reply: ServiceSender) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.run(&job, &reply).await {
                tracing::error!(job = %job.job_id, target = %job.target_name, "job failed: {e}");
                let status = BuildStatusMessage::for_job(&job, BuildStatus::Error).with_message(e.to_string());
                if let Err(send_err) = reply.send_json(&status).await {
                    tracing::warn!(job = %job.job_id, "could not report failure: {send_err}");
                }
            }
        })
    }
}
