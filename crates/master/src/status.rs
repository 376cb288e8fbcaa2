use std::sync::Arc;

use buildfarm_protocol::BuildStatusMessage;
use buildfarm_socket::{ConnectionId, HandlerFuture, Service, ServiceSender};

use crate::jobs::JobTracker;

/// Master end of `build-runner`: feeds runner status reports to the job
/// tracker and fails a runner's jobs when its connection drops.
pub struct RunnerStatusService {
    jobs: Arc<JobTracker>,
}

impl RunnerStatusService {
    pub fn new(jobs: Arc<JobTracker>) -> Self {
        Self { jobs }
    }
}

impl Service for RunnerStatusService {
    fn on_json_message(&self, sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        Box::pin(async move {
            match serde_json::from_value::<BuildStatusMessage>(value) {
                Ok(message) => self.jobs.status(sender.connection_id(), &message),
                Err(e) => tracing::warn!(connection_id = sender.connection_id(), "malformed status report: {e}"),
            }
        })
    }

    fn on_disconnected(&self, connection_id: ConnectionId) -> HandlerFuture<'_> {
        Box::pin(async move {
            let failed = self.jobs.fail_connection(connection_id);
            if failed > 0 {
                tracing::warn!(connection_id, failed, "runner lost with jobs in flight");
            }
        })
    }
}
