//! Engine-specific build invocation.
//!
//! Each invoker turns a prepared workspace plus a target configuration into
//! an engine command line, runs it and reports the exit code, the output
//! directory and the tail of what the engine printed.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use buildfarm_protocol::OsFamily;
use buildfarm_workspace::{EngineKind, PreparedWorkspace};
use serde::{Deserialize, Serialize};

use crate::{DIAGNOSTIC_TAIL_LINES, RunnerError};

fn default_execute_method() -> String {
    "BuildFarm.Builder.Build".into()
}

/// Per-target build settings from the runner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// OS family this target must be built on, if it matters.
    #[serde(default)]
    pub os: Option<OsFamily>,
    /// Unity `-buildTarget` value, e.g. `StandaloneWindows64`.
    #[serde(default)]
    pub unity_build_target: Option<String>,
    #[serde(default = "default_execute_method")]
    pub unity_execute_method: String,
    /// Godot export preset name.
    #[serde(default)]
    pub godot_preset: Option<String>,
    /// File name of the produced executable; defaults to the project id.
    #[serde(default)]
    pub artifact_name: Option<String>,
    /// Output directory relative to the project; defaults to `Builds/<name>`.
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os: None,
            unity_build_target: None,
            unity_execute_method: default_execute_method(),
            godot_preset: None,
            artifact_name: None,
            output_dir: None,
            extra_args: Vec::new(),
        }
    }

    /// Where the engine writes this target's artifacts.
    pub fn output_directory(&self, project_path: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) => project_path.join(dir),
            None => project_path.join("Builds").join(&self.name),
        }
    }

    fn artifact_name<'a>(&'a self, workspace: &'a PreparedWorkspace) -> &'a str {
        self.artifact_name.as_deref().unwrap_or(&workspace.project_id)
    }
}

/// Result of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub exit_code: i32,
    pub output_directory: PathBuf,
    /// Tail of the combined engine output.
    pub diagnostic: String,
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A boxed future returned by [`BuildInvoker::build`].
pub type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<BuildOutcome, RunnerError>> + Send + 'a>>;

/// Runs a build for one target.
///
/// A non-zero exit code is an `Ok` outcome; `Err` means the build could not
/// be started at all.
pub trait BuildInvoker: Send + Sync + 'static {
    fn build<'a>(&'a self, workspace: &'a PreparedWorkspace, target: &'a TargetConfig) -> BuildFuture<'a>;
}

/// Unity batch-mode builds through a static editor method.
#[derive(Debug, Clone)]
pub struct UnityInvoker {
    pub executable: PathBuf,
}

impl UnityInvoker {
    pub fn command_args(
        &self,
        workspace: &PreparedWorkspace,
        target: &TargetConfig,
        output: &Path,
    ) -> Result<Vec<OsString>, RunnerError> {
        let build_target = target
            .unity_build_target
            .as_deref()
            .ok_or_else(|| RunnerError::MissingTargetSetting {
                target: target.name.clone(),
                setting: "unity_build_target",
            })?;

        let mut args: Vec<OsString> = vec![
            "-batchmode".into(),
            "-nographics".into(),
            "-quit".into(),
            "-projectPath".into(),
            workspace.project_path.clone().into(),
            "-buildTarget".into(),
            build_target.into(),
            "-executeMethod".into(),
            target.unity_execute_method.as_str().into(),
            "-customBuildPath".into(),
            output.into(),
            "-customBuildName".into(),
            target.artifact_name(workspace).into(),
            "-logFile".into(),
            "-".into(),
        ];
        args.extend(target.extra_args.iter().map(OsString::from));
        Ok(args)
    }
}

impl BuildInvoker for UnityInvoker {
    fn build<'a>(&'a self, workspace: &'a PreparedWorkspace, target: &'a TargetConfig) -> BuildFuture<'a> {
        Box::pin(async move {
            let output = target.output_directory(&workspace.project_path);
            let args = self.command_args(workspace, target, &output)?;
            reset_output_dir(&output).await?;
            run_engine(&self.executable, &args, &workspace.project_path, output).await
        })
    }
}

/// Godot headless export of a named preset.
#[derive(Debug, Clone)]
pub struct GodotInvoker {
    pub executable: PathBuf,
}

impl GodotInvoker {
    pub fn command_args(
        &self,
        workspace: &PreparedWorkspace,
        target: &TargetConfig,
        output: &Path,
    ) -> Result<Vec<OsString>, RunnerError> {
        let preset = target
            .godot_preset
            .as_deref()
            .ok_or_else(|| RunnerError::MissingTargetSetting {
                target: target.name.clone(),
                setting: "godot_preset",
            })?;

        let mut args: Vec<OsString> = vec![
            "--headless".into(),
            "--path".into(),
            workspace.project_path.clone().into(),
            "--export-release".into(),
            preset.into(),
            output.join(target.artifact_name(workspace)).into(),
        ];
        args.extend(target.extra_args.iter().map(OsString::from));
        Ok(args)
    }
}

impl BuildInvoker for GodotInvoker {
    fn build<'a>(&'a self, workspace: &'a PreparedWorkspace, target: &'a TargetConfig) -> BuildFuture<'a> {
        Box::pin(async move {
            let output = target.output_directory(&workspace.project_path);
            let args = self.command_args(workspace, target, &output)?;
            reset_output_dir(&output).await?;
            run_engine(&self.executable, &args, &workspace.project_path, output).await
        })
    }
}

/// Picks the invoker matching the workspace's engine.
#[derive(Debug, Clone, Default)]
pub struct EngineInvoker {
    pub unity: Option<UnityInvoker>,
    pub godot: Option<GodotInvoker>,
}

impl BuildInvoker for EngineInvoker {
    fn build<'a>(&'a self, workspace: &'a PreparedWorkspace, target: &'a TargetConfig) -> BuildFuture<'a> {
        match workspace.engine {
            EngineKind::Unity => match &self.unity {
                Some(unity) => unity.build(workspace, target),
                None => Box::pin(async { Err(RunnerError::EngineNotConfigured(EngineKind::Unity)) }),
            },
            EngineKind::Godot => match &self.godot {
                Some(godot) => godot.build(workspace, target),
                None => Box::pin(async { Err(RunnerError::EngineNotConfigured(EngineKind::Godot)) }),
            },
        }
    }
}

/// Empties `dir` so stale artifacts from earlier builds are not uploaded.
async fn reset_output_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

async fn run_engine(
    executable: &Path,
    args: &[OsString],
    cwd: &Path,
    output_directory: PathBuf,
) -> Result<BuildOutcome, RunnerError> {
    tracing::info!(executable = %executable.display(), "starting engine");
    let output = tokio::process::Command::new(executable)
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    let exit_code = output.status.code().unwrap_or(-1);
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    tracing::info!(exit_code, "engine finished");
    Ok(BuildOutcome {
        exit_code,
        output_directory,
        diagnostic: output_tail(&text, DIAGNOSTIC_TAIL_LINES),
    })
}

/// Last `max_lines` non-empty lines of `text`.
pub fn output_tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
