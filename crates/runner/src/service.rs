//! Services a runner registers on its connection to the master.

use buildfarm_protocol::{BuildJob, BuildStatus, BuildStatusMessage, RunnerInfo};
use buildfarm_socket::{HandlerFuture, Service, ServiceSender};

use crate::queue::BuildQueue;

/// Receives [`BuildJob`]s on `build-runner` and queues them.
///
/// Each accepted job is acknowledged with a `Queued` status carrying its
/// queue position.
pub struct BuildRunnerService {
    queue: BuildQueue,
}

impl BuildRunnerService {
    pub fn new(queue: BuildQueue) -> Self {
        Self { queue }
    }
}

impl Service for BuildRunnerService {
    fn on_json_message(&self, sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        Box::pin(async move {
            let job: BuildJob = match serde_json::from_value(value) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!("ignoring malformed build job: {e}");
                    return;
                }
            };

            let status = match self.queue.enqueue(job.clone(), sender.clone()) {
                Ok(ahead) => {
                    tracing::info!(job = %job.job_id, target = %job.target_name, ahead, "job queued");
                    BuildStatusMessage::for_job(&job, BuildStatus::Queued)
                        .with_message(format!("{ahead} job(s) ahead"))
                }
                Err(e) => BuildStatusMessage::for_job(&job, BuildStatus::Error).with_message(e.to_string()),
            };
            if let Err(e) = sender.send_json(&status).await {
                tracing::warn!(job = %job.job_id, "failed to acknowledge job: {e}");
            }
        })
    }
}

/// Announces this runner on `runner-info` as soon as the link is up.
pub struct RunnerInfoService {
    info: RunnerInfo,
}

impl RunnerInfoService {
    pub fn new(info: RunnerInfo) -> Self {
        Self { info }
    }
}

impl Service for RunnerInfoService {
    fn on_connected(&self, sender: ServiceSender) -> HandlerFuture<'_> {
        Box::pin(async move {
            match sender.send_json(&self.info).await {
                Ok(()) => tracing::info!(name = %self.info.name, os = %self.info.os, "runner info sent"),
                Err(e) => tracing::warn!("failed to send runner info: {e}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    use buildfarm_protocol::OsFamily;
    use buildfarm_socket::FrameSender;
    use tokio_util::sync::CancellationToken;

    use crate::queue::JobHandler;

    struct Sleepy;

    impl JobHandler for Sleepy {
        fn handle(&self, _job: BuildJob, _reply: ServiceSender) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(tokio::time::sleep(std::time::Duration::from_millis(50)))
        }
    }

    #[tokio::test]
    async fn job_is_acknowledged_with_queued_status() {
        let queue = BuildQueue::spawn(Arc::new(Sleepy), CancellationToken::new());
        let service = BuildRunnerService::new(queue);
        let (frames, mut rx) = FrameSender::detached(3, 8);
        let job = serde_json::json!({
            "JobId": "j9", "ProjectId": "P", "TargetName": "OSX", "Branch": "main"
        });

        service
            .on_json_message(frames.service("build-runner"), job)
            .await;

        let ack: BuildStatusMessage = rx.recv().await.unwrap().parse_json().unwrap();
        assert_eq!(ack.status, BuildStatus::Queued);
        assert_eq!(ack.job_id.as_deref(), Some("j9"));
        assert_eq!(ack.message.as_deref(), Some("0 job(s) ahead"));
    }

    #[tokio::test]
    async fn malformed_job_is_ignored() {
        let queue = BuildQueue::spawn(Arc::new(Sleepy), CancellationToken::new());
        let service = BuildRunnerService::new(queue.clone());
        let (frames, mut rx) = FrameSender::detached(3, 8);

        service
            .on_json_message(frames.service("build-runner"), serde_json::json!({"Nope": 1}))
            .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn runner_info_sent_on_connect() {
        let info = RunnerInfo {
            name: "mac-mini".into(),
            os: OsFamily::MacOs,
            targets: vec!["OSX".into(), "iOS".into()],
        };
        let service = RunnerInfoService::new(info.clone());
        let (frames, mut rx) = FrameSender::detached(3, 8);

        service.on_connected(frames.service("runner-info")).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.service, "runner-info");
        assert_eq!(frame.parse_json::<RunnerInfo>().unwrap(), info);
    }
}
