//! Single-flight FIFO of build jobs.
//!
//! Jobs are handled strictly one after another by a single worker task, so
//! two builds never share the engine or the checkout on one machine. Each
//! job runs in its own task, so a panicking handler fails that job and the
//! worker moves on to the next.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use buildfarm_protocol::{BuildJob, BuildStatus, BuildStatusMessage};
use buildfarm_socket::ServiceSender;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::RunnerError;

/// Executes one dequeued job. Failures are reported through `reply`.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: BuildJob, reply: ServiceSender) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Whether the worker is running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Building,
}

struct QueuedJob {
    job: BuildJob,
    reply: ServiceSender,
}

/// Handle to the queue; cloning shares the same worker.
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    pending: Arc<AtomicUsize>,
    building: Arc<AtomicBool>,
}

impl BuildQueue {
    /// Starts the worker. It stops when `cancel` fires or every handle is
    /// dropped; a job in progress is abandoned on cancellation.
    pub fn spawn(handler: Arc<dyn JobHandler>, cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let building = Arc::new(AtomicBool::new(false));

        let worker_pending = Arc::clone(&pending);
        let worker_building = Arc::clone(&building);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some(QueuedJob { job, reply }) = next else {
                    break;
                };

                worker_building.store(true, Ordering::SeqCst);
                worker_pending.fetch_sub(1, Ordering::SeqCst);
                let job_id = job.job_id.clone();
                tracing::info!(job = %job_id, project = %job.project_id, target = %job.target_name, "build started");

                let failed = BuildStatusMessage::for_job(&job, BuildStatus::Error);
                let failure_reply = reply.clone();
                let job_handler = Arc::clone(&handler);
                let mut task = tokio::spawn(async move { job_handler.handle(job, reply).await });

                tokio::select! {
                    _ = cancel.cancelled() => {
                        task.abort();
                        tracing::warn!(job = %job_id, "build abandoned on shutdown");
                        break;
                    }
                    joined = &mut task => {
                        if let Err(e) = joined {
                            tracing::error!(job = %job_id, "build handler failed: {e}");
                            let status = failed.with_message(format!("runner failure: {e}"));
                            if let Err(send_err) = failure_reply.send_json(&status).await {
                                tracing::warn!(job = %job_id, "cannot report failed build: {send_err}");
                            }
                        }
                    }
                }

                worker_building.store(false, Ordering::SeqCst);
                tracing::info!(job = %job_id, "build finished");
            }
            worker_building.store(false, Ordering::SeqCst);
            tracing::debug!("build queue worker stopped");
        });

        Self {
            tx,
            pending,
            building,
        }
    }

    /// Appends a job; returns how many jobs are ahead of it, counting the
    /// one being built.
    pub fn enqueue(&self, job: BuildJob, reply: ServiceSender) -> Result<usize, RunnerError> {
        let waiting = self.pending.fetch_add(1, Ordering::SeqCst);
        let ahead = waiting + usize::from(self.building.load(Ordering::SeqCst));
        if self.tx.send(QueuedJob { job, reply }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(RunnerError::ShuttingDown);
        }
        Ok(ahead)
    }

    pub fn state(&self) -> QueueState {
        if self.building.load(Ordering::SeqCst) {
            QueueState::Building
        } else {
            QueueState::Idle
        }
    }

    /// Jobs waiting behind the one in progress.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use buildfarm_socket::FrameSender;
    use tokio::sync::Mutex;

    /// Records start/end of each job and the peak number running at once.
    #[derive(Default)]
    struct Recorder {
        running: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl JobHandler for Recorder {
        fn handle(&self, job: BuildJob, _reply: ServiceSender) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.order.lock().await.push(job.job_id);
                self.running.fetch_sub(1, Ordering::SeqCst);
            })
        }
    }

    fn job(id: &str) -> BuildJob {
        BuildJob {
            job_id: id.into(),
            project_id: "P".into(),
            target_name: "Windows64".into(),
            branch: "main".into(),
        }
    }

    async fn wait_idle(queue: &BuildQueue) {
        for _ in 0..500 {
            if queue.state() == QueueState::Idle && queue.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn concurrent_enqueues_never_overlap() {
        let recorder = Arc::new(Recorder::default());
        let queue = BuildQueue::spawn(recorder.clone(), CancellationToken::new());
        let (frames, _rx) = FrameSender::detached(1, 16);
        let reply = frames.service("build-runner");

        let mut tasks = Vec::new();
        for i in 0..6 {
            let queue = queue.clone();
            let reply = reply.clone();
            tasks.push(tokio::spawn(async move {
                queue.enqueue(job(&format!("j{i}")), reply).unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        // Let the worker pick up the first job before polling for idle.
        tokio::time::sleep(Duration::from_millis(5)).await;
        wait_idle(&queue).await;

        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.order.lock().await.len(), 6);
    }

    #[tokio::test]
    async fn fifo_order_and_positions() {
        let recorder = Arc::new(Recorder::default());
        let queue = BuildQueue::spawn(recorder.clone(), CancellationToken::new());
        let (frames, _rx) = FrameSender::detached(1, 16);
        let reply = frames.service("build-runner");

        assert_eq!(queue.enqueue(job("a"), reply.clone()).unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.state(), QueueState::Building);
        assert_eq!(queue.enqueue(job("b"), reply.clone()).unwrap(), 1);
        assert_eq!(queue.enqueue(job("c"), reply.clone()).unwrap(), 2);
        assert_eq!(queue.pending(), 2);

        wait_idle(&queue).await;
        assert_eq!(*recorder.order.lock().await, ["a", "b", "c"]);
    }

    /// Panics on job `boom`, records every other job.
    #[derive(Default)]
    struct Flaky {
        done: Mutex<Vec<String>>,
    }

    impl JobHandler for Flaky {
        fn handle(&self, job: BuildJob, _reply: ServiceSender) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                if job.job_id == "boom" {
                    panic!("engine crashed");
                }
                self.done.lock().await.push(job.job_id);
            })
        }
    }

    #[tokio::test]
    async fn panicking_job_fails_alone() {
        let flaky = Arc::new(Flaky::default());
        let queue = BuildQueue::spawn(flaky.clone(), CancellationToken::new());
        let (frames, mut rx) = FrameSender::detached(1, 16);
        let reply = frames.service("build-runner");

        queue.enqueue(job("boom"), reply.clone()).unwrap();
        queue.enqueue(job("next"), reply).unwrap();

        let status: BuildStatusMessage = rx.recv().await.unwrap().parse_json().unwrap();
        assert_eq!(status.status, BuildStatus::Error);
        assert!(status.message.unwrap().contains("panic"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        wait_idle(&queue).await;
        assert_eq!(*flaky.done.lock().await, ["next"]);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let cancel = CancellationToken::new();
        let queue = BuildQueue::spawn(Arc::new(Recorder::default()), cancel.clone());
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (frames, _rx) = FrameSender::detached(1, 4);
        let err = queue
            .enqueue(job("late"), frames.service("build-runner"))
            .unwrap_err();
        assert!(matches!(err, RunnerError::ShuttingDown));
        assert_eq!(queue.pending(), 0);
    }
}
