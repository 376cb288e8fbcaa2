//! Contracts for the external collaborators the orchestrator drives, plus
//! two generic implementations (a shell-command deployer and a tracing
//! notifier).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use buildfarm_protocol::BuildJob;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::CollaboratorError;

pub type CollaboratorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// What a target dispatch produced once the runner finished and the
/// artifacts were received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetResult {
    pub runner: String,
    pub build_time_ms: Option<i64>,
    pub artifact_path: Option<PathBuf>,
}

/// Sends one job to a runner and resolves when it completes or fails.
///
/// Implementations must return promptly once `cancel` fires.
pub trait TargetDispatcher: Send + Sync {
    fn dispatch(&self, job: BuildJob, cancel: CancellationToken) -> CollaboratorFuture<'_, TargetResult>;
}

/// Deploy ordering class. Store deploys run before infrastructure deploys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployTier {
    #[default]
    Store,
    Infrastructure,
}

impl std::fmt::Display for DeployTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeployTier::Store => "store",
            DeployTier::Infrastructure => "infrastructure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub project_id: String,
    pub version: Option<String>,
    pub target: String,
    pub artifact_path: Option<PathBuf>,
}

pub trait Deployer: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> DeployTier;

    /// Targets this deployer handles; empty means every target.
    fn targets(&self) -> &[String] {
        &[]
    }

    fn deploy<'a>(&'a self, request: &'a DeployRequest) -> CollaboratorFuture<'a, ()>;
}

/// Fire-and-forget report sink.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, text: &'a str) -> CollaboratorFuture<'a, ()>;
}

/// Writes reports to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, text: &'a str) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(target: "buildfarm::report", "\n{text}");
            Ok(())
        })
    }
}

/// Deploys by running an external program.
///
/// `{project}`, `{version}`, `{target}` and `{artifact}` in the arguments are
/// replaced before the program starts. A non-zero exit fails the deploy with
/// the tail of stderr.
pub struct CommandDeployer {
    name: String,
    tier: DeployTier,
    targets: Vec<String>,
    program: String,
    args: Vec<String>,
}

impl CommandDeployer {
    pub fn new(name: impl Into<String>, tier: DeployTier, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tier,
            targets: Vec::new(),
            program: program.into(),
            args,
        }
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    fn expand(&self, request: &DeployRequest) -> Vec<String> {
        let artifact = request
            .artifact_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let version = request.version.as_deref().unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{project}", &request.project_id)
                    .replace("{version}", version)
                    .replace("{target}", &request.target)
                    .replace("{artifact}", &artifact)
            })
            .collect()
    }
}

impl Deployer for CommandDeployer {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> DeployTier {
        self.tier
    }

    fn targets(&self) -> &[String] {
        &self.targets
    }

    fn deploy<'a>(&'a self, request: &'a DeployRequest) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            let args = self.expand(request);
            tracing::debug!(deployer = %self.name, program = %self.program, ?args, "running deploy command");

            let output = tokio::process::Command::new(&self.program)
                .args(&args)
                .kill_on_drop(true)
                .output()
                .await?;

            if output.status.success() {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            Err(CollaboratorError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail.join("\n")
            )))
        })
    }
}
