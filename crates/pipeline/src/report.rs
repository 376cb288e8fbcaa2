use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use buildfarm_protocol::BuildRequest;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collaborators::DeployTier;

/// Status of a stage, a target or a deploy step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    Queued,
    Pending,
    Succeed,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageStatus::Queued => "Queued",
            StageStatus::Pending => "Pending",
            StageStatus::Succeed => "Succeed",
            StageStatus::Failed => "Failed",
        })
    }
}

/// Outcome of one build target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub status: StageStatus,
    /// Runner that built the target.
    pub runner: Option<String>,
    /// Wall-clock time from dispatch to result.
    pub elapsed: Option<Duration>,
    /// Build time reported by the runner, in milliseconds.
    pub build_time_ms: Option<i64>,
    /// Where the uploaded artifacts landed on the master.
    pub artifact_path: Option<PathBuf>,
    /// Failure reason.
    pub message: Option<String>,
}

impl TargetReport {
    fn queued() -> Self {
        Self {
            status: StageStatus::Queued,
            runner: None,
            elapsed: None,
            build_time_ms: None,
            artifact_path: None,
            message: None,
        }
    }
}

/// Outcome of one deployer run for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub deployer: String,
    pub tier: DeployTier,
    pub target: String,
    pub status: StageStatus,
    pub message: Option<String>,
}

/// Aggregate status of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub project_id: String,
    pub branch: String,
    pub version: Option<String>,
    pub pre_build: StageStatus,
    pub build: StageStatus,
    pub deploy: StageStatus,
    pub post_build: StageStatus,
    pub targets: BTreeMap<String, TargetReport>,
    pub deploys: Vec<DeployReport>,
    pub change_log: Vec<String>,
    /// Completion headline, set once the run is decided.
    pub title: Option<String>,
    /// Completion detail: error text for a failed run.
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Option<Duration>,
}

impl PipelineReport {
    /// A report with every stage and requested target `Queued`.
    pub fn new(request: &BuildRequest) -> Self {
        Self {
            project_id: request.project_id.clone(),
            branch: request.branch.clone(),
            version: None,
            pre_build: StageStatus::Queued,
            build: StageStatus::Queued,
            deploy: StageStatus::Queued,
            post_build: StageStatus::Queued,
            targets: request
                .targets
                .iter()
                .map(|t| (t.clone(), TargetReport::queued()))
                .collect(),
            deploys: Vec::new(),
            change_log: Vec::new(),
            title: None,
            message: None,
            started_at: Utc::now(),
            elapsed: None,
        }
    }

    fn statuses(&self) -> impl Iterator<Item = StageStatus> + '_ {
        [self.pre_build, self.build, self.deploy, self.post_build]
            .into_iter()
            .chain(self.targets.values().map(|t| t.status))
    }

    /// Every tracked status is `Succeed`.
    pub fn is_successful(&self) -> bool {
        self.statuses().all(|s| s == StageStatus::Succeed)
    }

    /// Any tracked status is `Failed`.
    pub fn is_failed(&self) -> bool {
        self.statuses().any(|s| s == StageStatus::Failed)
    }

    /// Any tracked status is `Pending`.
    pub fn is_pending(&self) -> bool {
        self.statuses().any(|s| s == StageStatus::Pending)
    }

    /// Targets whose build succeeded, with their artifact paths.
    pub fn succeeded_targets(&self) -> impl Iterator<Item = (&str, Option<&PathBuf>)> {
        self.targets
            .iter()
            .filter(|(_, t)| t.status == StageStatus::Succeed)
            .map(|(name, t)| (name.as_str(), t.artifact_path.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(targets: &[&str]) -> BuildRequest {
        BuildRequest {
            project_id: "P".into(),
            branch: "main".into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            version_bump: Default::default(),
        }
    }

    #[test]
    fn new_report_is_queued() {
        let report = PipelineReport::new(&request(&["Windows64", "OSX"]));
        assert_eq!(report.targets.len(), 2);
        assert!(!report.is_successful());
        assert!(!report.is_failed());
        assert!(!report.is_pending());
    }

    #[test]
    fn all_succeed_is_successful() {
        let mut report = PipelineReport::new(&request(&["OSX"]));
        report.pre_build = StageStatus::Succeed;
        report.build = StageStatus::Succeed;
        report.deploy = StageStatus::Succeed;
        report.post_build = StageStatus::Succeed;
        assert!(!report.is_successful());

        report.targets.get_mut("OSX").unwrap().status = StageStatus::Succeed;
        assert!(report.is_successful());
        assert!(!report.is_failed());
    }

    #[test]
    fn one_failed_target_fails_the_report() {
        let mut report = PipelineReport::new(&request(&["A", "B", "C"]));
        for (name, t) in report.targets.iter_mut() {
            t.status = if name == "B" {
                StageStatus::Failed
            } else {
                StageStatus::Succeed
            };
        }
        assert!(report.is_failed());
        assert!(!report.is_successful());
        assert_eq!(
            report.succeeded_targets().map(|(n, _)| n).collect::<Vec<_>>(),
            ["A", "C"]
        );
    }

    #[test]
    fn pending_stage_is_pending() {
        let mut report = PipelineReport::new(&request(&["A"]));
        report.build = StageStatus::Pending;
        assert!(report.is_pending());
    }

    #[test]
    fn report_serializes() {
        let report = PipelineReport::new(&request(&["OSX"]));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pre_build"], "Queued");
        assert_eq!(json["targets"]["OSX"]["status"], "Queued");
    }
}
