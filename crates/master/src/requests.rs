use std::sync::Arc;

use buildfarm_pipeline::{Orchestrator, render_report};
use buildfarm_protocol::{BuildRequest, BuildRequestResponse};
use buildfarm_socket::{HandlerFuture, Service, ServiceSender};
use tokio_util::task::TaskTracker;

/// Master end of `build`: starts pipelines for clients.
///
/// Every request is answered at once with a [`BuildRequestResponse`]; an
/// accepted one is followed by the rendered report as a string message
/// when its pipeline ends. The tasks waiting on pipelines are spawned on
/// `tasks`.
pub struct BuildRequestService {
    orchestrator: Arc<Orchestrator>,
    tasks: TaskTracker,
}

impl BuildRequestService {
    pub fn new(orchestrator: Arc<Orchestrator>, tasks: TaskTracker) -> Self {
        Self { orchestrator, tasks }
    }
}

impl Service for BuildRequestService {
    fn on_json_message(&self, sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        Box::pin(async move {
            let connection_id = sender.connection_id();
            let request: BuildRequest = match serde_json::from_value(value) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(connection_id, "malformed build request: {e}");
                    let response = BuildRequestResponse {
                        accepted: false,
                        message: format!("malformed build request: {e}"),
                    };
                    if let Err(e) = sender.send_json(&response).await {
                        tracing::debug!(connection_id, "could not answer client: {e}");
                    }
                    return;
                }
            };

            let project = request.project_id.clone();
            let (response, pipeline) = match self.orchestrator.start(request) {
                Ok(pipeline) => (
                    BuildRequestResponse {
                        accepted: true,
                        message: format!("pipeline started for {project}"),
                    },
                    Some(pipeline),
                ),
                Err(e) => (
                    BuildRequestResponse {
                        accepted: false,
                        message: e.to_string(),
                    },
                    None,
                ),
            };

            tracing::info!(connection_id, %project, accepted = response.accepted, "build request answered");
            if let Err(e) = sender.send_json(&response).await {
                tracing::debug!(connection_id, "could not answer client: {e}");
            }

            // The response is queued first, so the report always follows it.
            let Some(pipeline) = pipeline else {
                return;
            };
            self.tasks.spawn(async move {
                match pipeline.await {
                    Ok(report) => {
                        if let Err(e) = sender.send_string(&render_report(&report)).await {
                            tracing::debug!(connection_id, "client gone before report: {e}");
                        }
                    }
                    Err(e) => tracing::error!(connection_id, "pipeline task failed: {e}"),
                }
            });
        })
    }
}
