//! Runner wiring and the link to the master.

use std::sync::Arc;

use anyhow::Context;
use buildfarm_protocol::constants::{SERVICE_BUILD_RUNNER, SERVICE_RUNNER_INFO};
use buildfarm_protocol::{OsFamily, RunnerInfo};
use buildfarm_runner::{
    BuildQueue, BuildRunnerService, EngineInvoker, GodotInvoker, JobExecutor, RunnerInfoService,
    UnityInvoker,
};
use buildfarm_socket::{ServiceRegistry, SocketClient, SocketError};
use buildfarm_workspace::LocalWorkspace;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::reconnect::ReconnectConfig;

/// Runs the runner until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let os = config
        .os
        .or_else(OsFamily::current)
        .context("unsupported host OS; set `os` in the runner config")?;

    let invoker = EngineInvoker {
        unity: config.unity_path.clone().map(|executable| UnityInvoker { executable }),
        godot: config.godot_path.clone().map(|executable| GodotInvoker { executable }),
    };
    if invoker.unity.is_none() && invoker.godot.is_none() {
        tracing::warn!("no engine configured, every job will fail");
    }

    let executor = JobExecutor::new(
        os,
        Arc::new(LocalWorkspace::new(&config.projects_root)),
        Arc::new(invoker),
        config.targets.clone(),
        config.fragment_size,
    );
    let info = RunnerInfo {
        name: config.name.clone(),
        os,
        targets: executor.target_names(),
    };
    tracing::info!(name = %info.name, %os, targets = ?info.targets, "runner configured");

    let queue = BuildQueue::spawn(Arc::new(executor), cancel.clone());

    let mut registry = ServiceRegistry::new();
    registry.register(SERVICE_BUILD_RUNNER, Arc::new(BuildRunnerService::new(queue)))?;
    registry.register(SERVICE_RUNNER_INFO, Arc::new(RunnerInfoService::new(info)))?;
    let registry = Arc::new(registry);

    let link = tokio::spawn(maintain_link(
        config.master_address.clone(),
        registry,
        config.reconnect.clone(),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    cancel.cancel();
    link.await?;
    Ok(())
}

/// Keeps one connection to the master open, redialing with backoff.
async fn maintain_link(
    address: String,
    registry: Arc<ServiceRegistry>,
    backoff: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        match SocketClient::connect(&address, Arc::clone(&registry), &cancel).await {
            Ok(conn) => {
                attempt = 0;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        conn.close();
                        break;
                    }
                    _ = conn.closed() => {
                        tracing::warn!(%address, "lost connection to master");
                    }
                }
            }
            Err(SocketError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(%address, attempt, "cannot reach master: {e}");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff.delay_for_attempt(attempt);
        tracing::debug!(?delay, attempt, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!("master link stopped");
}
