//! Wires the master components together.

use std::sync::Arc;

use buildfarm_master::Master;
use buildfarm_pipeline::{CommandDeployer, LogNotifier, Orchestrator, OrchestratorConfig};
use buildfarm_socket::{ServerConfig, SocketServer};
use buildfarm_workspace::LocalWorkspace;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the master until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    tokio::fs::create_dir_all(&config.receive_root).await?;
    let master = Master::new(&config.receive_root);

    // -- Pipeline --
    let mut orchestrator = Orchestrator::new(
        Arc::new(LocalWorkspace::new(&config.projects_root)),
        master.dispatcher(),
        OrchestratorConfig {
            target_timeout: config.target_timeout(),
        },
        cancel.clone(),
    );
    for deployer in &config.deployers {
        tracing::info!(name = %deployer.name, tier = %deployer.tier, "deployer configured");
        orchestrator = orchestrator.with_deployer(Arc::new(
            CommandDeployer::new(
                deployer.name.clone(),
                deployer.tier,
                deployer.program.clone(),
                deployer.args.clone(),
            )
            .with_targets(deployer.targets.clone()),
        ));
    }
    if config.hooks.log {
        orchestrator = orchestrator.with_notifier(Arc::new(LogNotifier));
    }

    // -- Socket server --
    let registry = master.service_registry(Arc::new(orchestrator))?;
    let server = SocketServer::new(
        ServerConfig {
            bind_address: config.bind_address,
            port: config.port,
        },
        registry,
        cancel.clone(),
    );
    let listener = server.bind().await?;
    let server_run = Arc::clone(&server);
    let server_task = tokio::spawn(async move { server_run.serve(listener).await });

    let sweeper = master.artifacts().spawn_stale_sweep(
        config.stale_sweep_interval(),
        config.fragment_stale_after(),
        cancel.clone(),
    );

    tracing::info!(receive_root = %config.receive_root.display(), "master ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    // -- Graceful shutdown --
    cancel.cancel();
    server_task.await??;
    sweeper.await?;
    master.shutdown().await;
    Ok(())
}
