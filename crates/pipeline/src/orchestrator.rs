//! Pipeline orchestrator.
//!
//! A run walks `PreBuild → Build → Deploy → PostBuild`. Collaborator
//! failures become report status; only a failed workspace preparation cuts
//! the run short (straight to PostBuild so the failure is still reported).
//! At most one run per project id is active at a time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use buildfarm_protocol::{BuildJob, BuildRequest};
use buildfarm_workspace::{PreparedWorkspace, Workspace};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::{DeployRequest, Deployer, Notifier, TargetDispatcher, TargetResult};
use crate::render::render_report;
use crate::report::{DeployReport, PipelineReport, StageStatus};
use crate::{CollaboratorError, PipelineError};

/// Default per-target liveness timeout (2 hours).
pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long one target may take from dispatch to verified artifacts.
    pub target_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            target_timeout: DEFAULT_TARGET_TIMEOUT,
        }
    }
}

type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Removes the project from the active set when the run ends, however it ends.
struct ActiveGuard {
    active: ActiveSet,
    project_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project_id);
    }
}

pub struct Orchestrator {
    workspace: Arc<dyn Workspace>,
    dispatcher: Arc<dyn TargetDispatcher>,
    deployers: Vec<Arc<dyn Deployer>>,
    notifiers: Vec<Arc<dyn Notifier>>,
    config: OrchestratorConfig,
    active: ActiveSet,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Runs stop when `cancel` fires; targets still building are failed.
    pub fn new(
        workspace: Arc<dyn Workspace>,
        dispatcher: Arc<dyn TargetDispatcher>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workspace,
            dispatcher,
            deployers: Vec::new(),
            notifiers: Vec::new(),
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployers.push(deployer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn is_active(&self, project_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(project_id)
    }

    /// Runs the pipeline to completion on the current task.
    pub async fn run(&self, request: BuildRequest) -> Result<PipelineReport, PipelineError> {
        let _guard = self.acquire(&request)?;
        Ok(self.execute(request).await)
    }

    /// Claims the project synchronously, then runs the pipeline on its own
    /// task. A busy project is rejected here, before anything is spawned.
    pub fn start(self: &Arc<Self>, request: BuildRequest) -> Result<JoinHandle<PipelineReport>, PipelineError> {
        let guard = self.acquire(&request)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            this.execute(request).await
        }))
    }

    fn acquire(&self, request: &BuildRequest) -> Result<ActiveGuard, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        if request.targets.is_empty() {
            return Err(PipelineError::NoTargets);
        }
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(request.project_id.clone()) {
            warn!(project = %request.project_id, "rejected request: pipeline already active");
            return Err(PipelineError::AlreadyActive(request.project_id.clone()));
        }
        Ok(ActiveGuard {
            active: Arc::clone(&self.active),
            project_id: request.project_id.clone(),
        })
    }

    async fn execute(&self, request: BuildRequest) -> PipelineReport {
        let started = Instant::now();
        let cancel = self.cancel.child_token();
        let mut report = PipelineReport::new(&request);
        info!(project = %request.project_id, branch = %request.branch, targets = ?request.targets, "pipeline started");

        let workspace = match self.pre_build(&request, &mut report).await {
            Some(workspace) => workspace,
            None => {
                self.post_build(&mut report, None, started).await;
                return report;
            }
        };

        self.build(&request, &mut report, &cancel).await;
        self.deploy(&mut report, &cancel).await;
        self.post_build(&mut report, Some(&workspace), started).await;
        report
    }

    /// Returns `None` when the workspace could not be prepared.
    async fn pre_build(&self, request: &BuildRequest, report: &mut PipelineReport) -> Option<PreparedWorkspace> {
        report.pre_build = StageStatus::Pending;

        let workspace = match self.workspace.prepare(&request.project_id, &request.branch).await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(project = %request.project_id, "workspace preparation failed: {e}");
                report.pre_build = StageStatus::Failed;
                report.message = Some(format!("workspace preparation failed: {e}"));
                return None;
            }
        };

        let mut status = StageStatus::Succeed;
        if let Err(e) = self.workspace.update(&workspace).await {
            warn!(project = %request.project_id, "workspace update failed: {e}");
            status = StageStatus::Failed;
        }
        match self.workspace.version_bump(&workspace, request.version_bump).await {
            Ok(version) => {
                info!(project = %request.project_id, %version, "version resolved");
                report.version = Some(version);
            }
            Err(e) => {
                warn!(project = %request.project_id, "version bump failed: {e}");
                status = StageStatus::Failed;
            }
        }
        match self.workspace.change_log(&workspace).await {
            Ok(lines) => report.change_log = lines,
            Err(e) => {
                warn!(project = %request.project_id, "changelog unavailable: {e}");
                status = StageStatus::Failed;
            }
        }
        report.pre_build = status;
        Some(workspace)
    }

    /// Fans out one task per target and waits for all of them.
    async fn build(&self, request: &BuildRequest, report: &mut PipelineReport, cancel: &CancellationToken) {
        report.build = StageStatus::Pending;

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for (target, entry) in report.targets.iter_mut() {
            entry.status = StageStatus::Pending;
            let job = BuildJob {
                job_id: uuid::Uuid::new_v4().to_string(),
                project_id: request.project_id.clone(),
                target_name: target.clone(),
                branch: request.branch.clone(),
            };
            info!(project = %job.project_id, target = %job.target_name, job = %job.job_id, "dispatching target");

            let dispatcher = Arc::clone(&self.dispatcher);
            let token = cancel.child_token();
            let timeout = self.config.target_timeout;
            let handle = tasks.spawn(async move {
                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CollaboratorError::Cancelled),
                    r = tokio::time::timeout(timeout, dispatcher.dispatch(job, token.clone())) => {
                        r.unwrap_or(Err(CollaboratorError::Timeout(timeout)))
                    }
                };
                // Lets the dispatcher drop any state it still holds for the job.
                token.cancel();
                (result, started.elapsed())
            });
            names.insert(handle.id(), target.clone());
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, (result, elapsed))) => (id, Some((result, elapsed))),
                Err(e) => {
                    error!("target task failed: {e}");
                    (e.id(), None)
                }
            };
            let Some(target) = names.remove(&id) else {
                continue;
            };
            let Some(entry) = report.targets.get_mut(&target) else {
                continue;
            };

            match outcome {
                Some((Ok(TargetResult { runner, build_time_ms, artifact_path }), elapsed)) => {
                    info!(project = %report.project_id, %target, %runner, "target succeeded");
                    entry.status = StageStatus::Succeed;
                    entry.runner = Some(runner);
                    entry.build_time_ms = build_time_ms;
                    entry.artifact_path = artifact_path;
                    entry.elapsed = Some(elapsed);
                }
                Some((Err(e), elapsed)) => {
                    warn!(project = %report.project_id, %target, "target failed: {e}");
                    entry.status = StageStatus::Failed;
                    entry.message = Some(e.to_string());
                    entry.elapsed = Some(elapsed);
                }
                None => {
                    entry.status = StageStatus::Failed;
                    entry.message = Some("target task panicked".into());
                }
            }
        }

        report.build = if report.targets.values().all(|t| t.status == StageStatus::Succeed) {
            StageStatus::Succeed
        } else {
            StageStatus::Failed
        };
    }

    /// Store deployers run before infrastructure deployers; within a tier
    /// registration order is kept. Only succeeded targets are deployed.
    async fn deploy(&self, report: &mut PipelineReport, cancel: &CancellationToken) {
        let built: Vec<DeployRequest> = report
            .succeeded_targets()
            .map(|(target, artifact)| DeployRequest {
                project_id: report.project_id.clone(),
                version: report.version.clone(),
                target: target.to_string(),
                artifact_path: artifact.cloned(),
            })
            .collect();
        if built.is_empty() {
            info!(project = %report.project_id, "no built targets, deploy skipped");
            return;
        }

        report.deploy = StageStatus::Pending;
        let mut ordered: Vec<&Arc<dyn Deployer>> = self.deployers.iter().collect();
        ordered.sort_by_key(|d| d.tier());

        let mut status = StageStatus::Succeed;
        for deployer in ordered {
            for request in &built {
                let wanted = deployer.targets();
                if !wanted.is_empty() && !wanted.contains(&request.target) {
                    continue;
                }

                let result = if cancel.is_cancelled() {
                    Err(CollaboratorError::Cancelled)
                } else {
                    deployer.deploy(request).await
                };
                let (entry_status, message) = match result {
                    Ok(()) => {
                        info!(deployer = deployer.name(), target = %request.target, "deploy succeeded");
                        (StageStatus::Succeed, None)
                    }
                    Err(e) => {
                        warn!(deployer = deployer.name(), target = %request.target, "deploy failed: {e}");
                        status = StageStatus::Failed;
                        (StageStatus::Failed, Some(e.to_string()))
                    }
                };
                report.deploys.push(DeployReport {
                    deployer: deployer.name().to_string(),
                    tier: deployer.tier(),
                    target: request.target.clone(),
                    status: entry_status,
                    message,
                });
            }
        }
        report.deploy = status;
    }

    async fn post_build(&self, report: &mut PipelineReport, workspace: Option<&PreparedWorkspace>, started: Instant) {
        report.post_build = StageStatus::Pending;

        let succeeded = [report.pre_build, report.build, report.deploy]
            .iter()
            .all(|s| *s == StageStatus::Succeed);
        let mut status = StageStatus::Succeed;

        if succeeded
            && let (Some(workspace), Some(version)) = (workspace, report.version.as_deref())
            && let Err(e) = self.workspace.mark_released(workspace, version).await
        {
            warn!(project = %report.project_id, "could not archive changelog: {e}");
            status = StageStatus::Failed;
        }

        let version = report.version.as_deref().map(|v| format!(" {v}")).unwrap_or_default();
        report.title = Some(if succeeded && status == StageStatus::Succeed {
            format!("{}{version} build succeeded", report.project_id)
        } else {
            format!("{}{version} build failed", report.project_id)
        });
        report.elapsed = Some(started.elapsed());
        report.post_build = status;

        let text = render_report(report);
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&text).await {
                warn!(project = %report.project_id, "notification failed: {e}");
                report.post_build = StageStatus::Failed;
            }
        }

        info!(
            project = %report.project_id,
            successful = report.is_successful(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
    }
}
