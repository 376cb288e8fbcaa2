//! Master end of `file-transfer`: rebuilds uploaded artifacts under the
//! receive root and verifies each upload summary.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use buildfarm_protocol::{FileFragment, UploadSummary};
use buildfarm_socket::{ConnectionId, HandlerFuture, Service, ServiceSender};
use buildfarm_transfer::{FragmentOutcome, Reassembler, verify_upload};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::JobTracker;

struct ReceiverState {
    reassembler: Reassembler,
    /// Upload directories each connection has files in flight for.
    uploads: HashMap<ConnectionId, HashSet<String>>,
}

pub struct ArtifactReceiver {
    state: Mutex<ReceiverState>,
    jobs: Arc<JobTracker>,
}

impl ArtifactReceiver {
    pub fn new(receive_root: impl Into<PathBuf>, jobs: Arc<JobTracker>) -> Self {
        Self {
            state: Mutex::new(ReceiverState {
                reassembler: Reassembler::new(receive_root),
                uploads: HashMap::new(),
            }),
            jobs,
        }
    }

    pub async fn pending_files(&self) -> usize {
        self.state.lock().await.reassembler.pending_len()
    }

    /// Evicts partial files idle for longer than `max_idle`.
    pub async fn sweep(&self, max_idle: Duration) -> usize {
        let evicted = self.state.lock().await.reassembler.evict_stale(max_idle).await;
        evicted.len()
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_stale_sweep(self: &Arc<Self>, interval: Duration, max_idle: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let receiver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = receiver.sweep(max_idle).await;
                        if evicted > 0 {
                            tracing::warn!(evicted, "stale transfers evicted");
                        }
                    }
                }
            }
            tracing::debug!("stale transfer sweep stopped");
        })
    }
}

impl Service for ArtifactReceiver {
    fn on_data_message(&self, sender: ServiceSender, data: Vec<u8>) -> HandlerFuture<'_> {
        Box::pin(async move {
            let connection_id = sender.connection_id();
            let fragment = match FileFragment::decode(&data) {
                Ok(fragment) => fragment,
                Err(e) => {
                    tracing::warn!(connection_id, "malformed fragment dropped: {e}");
                    return;
                }
            };

            let mut state = self.state.lock().await;
            state
                .uploads
                .entry(connection_id)
                .or_default()
                .insert(fragment.directory.clone());
            match state.reassembler.apply(fragment).await {
                Ok(FragmentOutcome::Completed { key, size, .. }) => {
                    tracing::debug!(connection_id, %key, bytes = size, "file received");
                }
                Ok(FragmentOutcome::Duplicate { key }) => {
                    tracing::debug!(connection_id, %key, "duplicate fragment skipped");
                }
                Ok(FragmentOutcome::Written { .. }) => {}
                Err(e) => tracing::warn!(connection_id, "fragment rejected: {e}"),
            }
        })
    }

    fn on_json_message(&self, sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        Box::pin(async move {
            let connection_id = sender.connection_id();
            let summary: UploadSummary = match serde_json::from_value(value) {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(connection_id, "malformed upload summary: {e}");
                    return;
                }
            };

            let finished = {
                let mut state = self.state.lock().await;
                if let Some(dirs) = state.uploads.get_mut(&connection_id) {
                    dirs.remove(&summary.directory_name);
                }
                state.reassembler.finish_upload(&summary).await
            };
            let result = match finished {
                Ok(dir) => verify_upload(&dir, &summary).await.map(|()| dir),
                Err(e) => Err(e),
            };
            match &result {
                Ok(path) => tracing::info!(
                    connection_id,
                    directory = %summary.directory_name,
                    files = summary.files.len(),
                    bytes = summary.total_bytes(),
                    path = %path.display(),
                    "upload verified"
                ),
                Err(e) => tracing::warn!(connection_id, directory = %summary.directory_name, "upload rejected: {e}"),
            }
            self.jobs.artifacts(
                summary.job_id.as_deref(),
                &summary.directory_name,
                result.map_err(|e| e.to_string()),
            );
        })
    }

    fn on_disconnected(&self, connection_id: ConnectionId) -> HandlerFuture<'_> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(dirs) = state.uploads.remove(&connection_id) else {
                return;
            };
            for dir in dirs {
                let aborted = state.reassembler.abort_directory(&dir).await;
                if aborted > 0 {
                    tracing::warn!(connection_id, directory = %dir, aborted, "partial upload discarded");
                }
            }
        })
    }
}
