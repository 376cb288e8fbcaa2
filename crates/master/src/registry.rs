//! Live runners known to the master, keyed by connection id.

use std::collections::BTreeMap;
use std::sync::Arc;

use buildfarm_protocol::constants::SERVICE_BUILD_RUNNER;
use buildfarm_protocol::{OsFamily, RunnerInfo};
use buildfarm_socket::{ConnectionId, HandlerFuture, Service, ServiceSender};
use tokio::sync::RwLock;

struct RunnerEntry {
    info: RunnerInfo,
    jobs: ServiceSender,
}

/// A runner picked to build a target.
#[derive(Clone)]
pub struct SelectedRunner {
    pub connection_id: ConnectionId,
    pub info: RunnerInfo,
    /// `build-runner` channel on the runner's connection.
    pub jobs: ServiceSender,
}

/// Whether `info` can build `target`.
///
/// The target name decides the OS family when it carries a hint; a runner
/// that lists its targets must also list this one.
pub fn serves(info: &RunnerInfo, target: &str) -> bool {
    let listed = info.targets.iter().any(|t| t == target);
    let os_matches = match OsFamily::infer_from_target(target) {
        Some(os) => info.os == os,
        None => listed,
    };
    os_matches && (info.targets.is_empty() || listed)
}

#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<BTreeMap<ConnectionId, RunnerEntry>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: ConnectionId, info: RunnerInfo, jobs: ServiceSender) {
        tracing::info!(connection_id, runner = %info.name, os = %info.os, targets = ?info.targets, "runner registered");
        self.runners
            .write()
            .await
            .insert(connection_id, RunnerEntry { info, jobs });
    }

    pub async fn remove(&self, connection_id: ConnectionId) -> Option<RunnerInfo> {
        let removed = self.runners.write().await.remove(&connection_id)?;
        tracing::info!(connection_id, runner = %removed.info.name, "runner removed");
        Some(removed.info)
    }

    /// First live runner, by connection order, that serves `target`.
    pub async fn select(&self, target: &str) -> Option<SelectedRunner> {
        self.runners
            .read()
            .await
            .iter()
            .find(|(_, entry)| entry.jobs.is_connected() && serves(&entry.info, target))
            .map(|(id, entry)| SelectedRunner {
                connection_id: *id,
                info: entry.info.clone(),
                jobs: entry.jobs.clone(),
            })
    }

    pub async fn list(&self) -> Vec<(ConnectionId, RunnerInfo)> {
        self.runners
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.info.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }
}

/// Master end of `runner-info`: records who is on the other side.
pub struct RunnerInfoService {
    runners: Arc<RunnerRegistry>,
}

impl RunnerInfoService {
    pub fn new(runners: Arc<RunnerRegistry>) -> Self {
        Self { runners }
    }
}

impl Service for RunnerInfoService {
    fn on_json_message(&self, sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        Box::pin(async move {
            match serde_json::from_value::<RunnerInfo>(value) {
                Ok(info) => {
                    let jobs = sender.frames().service(SERVICE_BUILD_RUNNER);
                    self.runners.register(sender.connection_id(), info, jobs).await;
                }
                Err(e) => {
                    tracing::warn!(connection_id = sender.connection_id(), "malformed runner info: {e}")
                }
            }
        })
    }

    fn on_disconnected(&self, connection_id: ConnectionId) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.runners.remove(connection_id).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_socket::FrameSender;

    fn info(name: &str, os: OsFamily, targets: &[&str]) -> RunnerInfo {
        RunnerInfo {
            name: name.into(),
            os,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn target_matching() {
        let mac = info("mac", OsFamily::MacOs, &[]);
        assert!(serves(&mac, "OSX"));
        assert!(serves(&mac, "iOS"));
        assert!(!serves(&mac, "Windows64"));
        assert!(!serves(&mac, "Switch"));

        let console = info("devkit", OsFamily::Windows, &["Switch", "Windows64"]);
        assert!(serves(&console, "Switch"));
        assert!(serves(&console, "Windows64"));
        assert!(!serves(&console, "Win32"));
    }

    #[tokio::test]
    async fn first_live_runner_wins() {
        let registry = RunnerRegistry::new();
        let (a, _rx_a) = FrameSender::detached(2, 4);
        let (b, _rx_b) = FrameSender::detached(5, 4);
        registry
            .register(5, info("linux-b", OsFamily::Linux, &[]), b.service(SERVICE_BUILD_RUNNER))
            .await;
        registry
            .register(2, info("linux-a", OsFamily::Linux, &[]), a.service(SERVICE_BUILD_RUNNER))
            .await;

        let picked = registry.select("Linux64").await.unwrap();
        assert_eq!(picked.connection_id, 2);
        assert_eq!(picked.info.name, "linux-a");

        a.close();
        let picked = registry.select("Linux64").await.unwrap();
        assert_eq!(picked.info.name, "linux-b");
        assert!(registry.select("OSX").await.is_none());
    }

    #[tokio::test]
    async fn info_service_registers_and_removes() {
        let registry = Arc::new(RunnerRegistry::new());
        let service = RunnerInfoService::new(registry.clone());
        let (frames, _rx) = FrameSender::detached(9, 4);

        let json = serde_json::json!({"Name": "mac-mini", "Os": "macOS", "Targets": ["OSX"]});
        service.on_json_message(frames.service("runner-info"), json).await;
        assert_eq!(registry.len().await, 1);
        let picked = registry.select("OSX").await.unwrap();
        assert_eq!(picked.jobs.service_name(), "build-runner");

        service.on_disconnected(9).await;
        assert_eq!(registry.len().await, 0);
    }
}
