//! Full farm over loopback TCP: a master, real runner stacks with fake
//! engines, and a client issuing build requests.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buildfarm_master::Master;
use buildfarm_pipeline::{CollaboratorFuture, Notifier, Orchestrator, OrchestratorConfig};
use buildfarm_protocol::{BuildRequest, BuildRequestResponse, OsFamily, RunnerInfo, VersionBump};
use buildfarm_runner::{
    BuildFuture, BuildInvoker, BuildOutcome, BuildQueue, BuildRunnerService, JobExecutor,
    TargetConfig,
};
use buildfarm_socket::{
    Connection, HandlerFuture, ServerConfig, Service, ServiceRegistry, ServiceSender, SocketClient,
    SocketServer,
};
use buildfarm_workspace::{EngineKind, PreparedWorkspace, Workspace, WorkspaceFuture};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Workspace rooted at a fixed directory; version is always 1.2.3.
struct FixedWorkspace {
    root: PathBuf,
}

impl Workspace for FixedWorkspace {
    fn prepare<'a>(&'a self, project_id: &'a str, branch: &'a str) -> WorkspaceFuture<'a, PreparedWorkspace> {
        Box::pin(async move {
            Ok(PreparedWorkspace {
                project_id: project_id.into(),
                branch: branch.into(),
                project_path: self.root.join(project_id),
                engine: EngineKind::Unity,
            })
        })
    }

    fn update<'a>(&'a self, _workspace: &'a PreparedWorkspace) -> WorkspaceFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn version_bump<'a>(&'a self, _workspace: &'a PreparedWorkspace, _bump: VersionBump) -> WorkspaceFuture<'a, String> {
        Box::pin(async { Ok("1.2.3".to_string()) })
    }

    fn change_log<'a>(&'a self, _workspace: &'a PreparedWorkspace) -> WorkspaceFuture<'a, Vec<String>> {
        Box::pin(async { Ok(vec!["New boss fight".to_string()]) })
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    /// Waits for the gate, then succeeds.
    Gated,
    Hang,
}

/// Writes a small artifact tree for the target, then behaves as configured.
struct FakeEngine {
    behavior: HashMap<String, Behavior>,
    gate: Arc<Notify>,
}

impl BuildInvoker for FakeEngine {
    fn build<'a>(&'a self, workspace: &'a PreparedWorkspace, target: &'a TargetConfig) -> BuildFuture<'a> {
        Box::pin(async move {
            let behavior = self
                .behavior
                .get(&target.name)
                .copied()
                .unwrap_or(Behavior::Succeed);
            match behavior {
                Behavior::Gated => self.gate.notified().await,
                Behavior::Hang => std::future::pending::<()>().await,
                Behavior::Succeed | Behavior::Fail => {}
            }

            let out = target.output_directory(&workspace.project_path);
            tokio::fs::create_dir_all(out.join("Data")).await?;
            tokio::fs::write(out.join("game.exe"), format!("binary for {}", target.name)).await?;
            let pak: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
            tokio::fs::write(out.join("Data").join("level1.pak"), pak).await?;
            tokio::fs::write(out.join("Data").join("empty.cfg"), b"").await?;

            let exit_code = if matches!(behavior, Behavior::Fail) { 1 } else { 0 };
            Ok(BuildOutcome {
                exit_code,
                output_directory: out,
                diagnostic: "Build failed: error CS0246".into(),
            })
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    texts: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(&'a self, text: &'a str) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        })
    }
}

enum ClientEvent {
    Response(BuildRequestResponse),
    Report(String),
}

/// Client end of `build`.
struct ClientRecorder {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Service for ClientRecorder {
    fn on_json_message(&self, _sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        Box::pin(async move {
            let response: BuildRequestResponse = serde_json::from_value(value).unwrap();
            let _ = self.events.send(ClientEvent::Response(response));
        })
    }

    fn on_string_message(&self, _sender: ServiceSender, text: String) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = self.events.send(ClientEvent::Report(text));
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Farm {
    addr: String,
    master: Master,
    notifier: Arc<RecordingNotifier>,
    receive_root: TempDir,
    cancel: CancellationToken,
}

impl Farm {
    async fn start() -> Self {
        let receive_root = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let master = Master::new(receive_root.path());
        let notifier = Arc::new(RecordingNotifier::default());

        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(FixedWorkspace {
                    root: PathBuf::from("/tmp"),
                }),
                master.dispatcher(),
                OrchestratorConfig {
                    target_timeout: Duration::from_secs(30),
                },
                cancel.clone(),
            )
            .with_notifier(notifier.clone()),
        );
        let registry = master.service_registry(orchestrator).unwrap();

        let server = SocketServer::new(
            ServerConfig {
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
            },
            registry,
            cancel.clone(),
        );
        let listener = server.bind().await.unwrap();
        let addr = server.local_addr().await.unwrap().to_string();
        tokio::spawn(async move { server.serve(listener).await });

        Self {
            addr,
            master,
            notifier,
            receive_root,
            cancel,
        }
    }

    /// Connects a runner and waits until the master registered it.
    async fn add_runner(&self, name: &str, os: OsFamily, targets: &[(&str, Behavior)], gate: Arc<Notify>) -> Runner {
        let projects = TempDir::new().unwrap();
        let engine = FakeEngine {
            behavior: targets
                .iter()
                .map(|(t, b)| (t.to_string(), *b))
                .collect(),
            gate,
        };
        let executor = JobExecutor::new(
            os,
            Arc::new(FixedWorkspace {
                root: projects.path().to_path_buf(),
            }),
            Arc::new(engine),
            targets.iter().map(|(t, _)| TargetConfig::new(*t)),
            1024,
        );
        let info = RunnerInfo {
            name: name.into(),
            os,
            targets: executor.target_names(),
        };
        let queue = BuildQueue::spawn(Arc::new(executor), self.cancel.clone());

        let mut registry = ServiceRegistry::new();
        registry
            .register("build-runner", Arc::new(BuildRunnerService::new(queue)))
            .unwrap();
        registry
            .register("runner-info", Arc::new(buildfarm_runner::RunnerInfoService::new(info)))
            .unwrap();

        let before = self.master.runners().len().await;
        let connection = SocketClient::connect(&self.addr, Arc::new(registry), &self.cancel)
            .await
            .unwrap();
        for _ in 0..400 {
            if self.master.runners().len().await > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(self.master.runners().len().await > before, "runner {name} never registered");

        Runner {
            projects,
            connection,
        }
    }

    async fn client(&self) -> Client {
        let (tx, events) = mpsc::unbounded_channel();
        let mut registry = ServiceRegistry::new();
        registry
            .register("build", Arc::new(ClientRecorder { events: tx }))
            .unwrap();
        let connection = SocketClient::connect(&self.addr, Arc::new(registry), &self.cancel)
            .await
            .unwrap();
        Client { connection, events }
    }
}

impl Drop for Farm {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Runner {
    projects: TempDir,
    connection: Connection,
}

impl Runner {
    fn output(&self, project: &str, target: &str) -> PathBuf {
        self.projects.path().join(project).join("Builds").join(target)
    }
}

struct Client {
    connection: Connection,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Client {
    async fn request(&self, project: &str, targets: &[&str]) {
        let request = BuildRequest {
            project_id: project.into(),
            branch: "main".into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            version_bump: VersionBump {
                patch: true,
                ..Default::default()
            },
        };
        self.connection
            .service("build")
            .send_json(&request)
            .await
            .unwrap();
    }

    async fn next(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(20), self.events.recv())
            .await
            .expect("client event timed out")
            .expect("client channel closed")
    }

    async fn response(&mut self) -> BuildRequestResponse {
        match self.next().await {
            ClientEvent::Response(response) => response,
            ClientEvent::Report(text) => panic!("expected response, got report:\n{text}"),
        }
    }

    async fn report(&mut self) -> String {
        match self.next().await {
            ClientEvent::Report(text) => text,
            ClientEvent::Response(response) => panic!("expected report, got {response:?}"),
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Relative path → contents for every file under `root`.
fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_platform_build_uploads_identical_trees_and_notifies_once() {
    let farm = Farm::start().await;
    let gate = Arc::new(Notify::new());
    let win = farm
        .add_runner("win-box", OsFamily::Windows, &[("Windows64", Behavior::Succeed)], gate.clone())
        .await;
    let mac = farm
        .add_runner("mac-mini", OsFamily::MacOs, &[("OSX", Behavior::Succeed)], gate)
        .await;

    let mut client = farm.client().await;
    client.request("P", &["Windows64", "OSX"]).await;

    let response = client.response().await;
    assert!(response.accepted, "{}", response.message);

    let report = client.report().await;
    assert!(report.contains("P 1.2.3 build succeeded"), "{report}");
    assert!(report.contains("Windows64: Succeed"), "{report}");
    assert!(report.contains("OSX: Succeed"), "{report}");
    assert!(report.contains("New boss fight"));

    for (runner, target) in [(&win, "Windows64"), (&mac, "OSX")] {
        let sent = read_tree(&runner.output("P", target));
        let received = read_tree(&farm.receive_root.path().join("P").join(target));
        assert_eq!(sent.len(), 3);
        assert_eq!(sent, received, "{target} tree differs");
    }

    let texts = farm.notifier.texts.lock().unwrap();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("1.2.3"));
    assert!(texts[0].contains("Windows64") && texts[0].contains("OSX"));
    assert_eq!(farm.master.jobs().outstanding(), 0);
}

#[tokio::test]
async fn one_failing_target_is_reported_without_blocking_the_rest() {
    let farm = Farm::start().await;
    let gate = Arc::new(Notify::new());
    let _linux = farm
        .add_runner(
            "linux-box",
            OsFamily::Linux,
            &[("Linux64", Behavior::Fail), ("LinuxServer", Behavior::Succeed)],
            gate.clone(),
        )
        .await;
    let _win = farm
        .add_runner("win-box", OsFamily::Windows, &[("Windows64", Behavior::Succeed)], gate)
        .await;

    let mut client = farm.client().await;
    client.request("P", &["Linux64", "LinuxServer", "Windows64"]).await;
    assert!(client.response().await.accepted);

    let report = client.report().await;
    assert!(report.contains("P 1.2.3 build failed"), "{report}");
    assert!(report.contains("Linux64: Failed"), "{report}");
    assert!(report.contains("exit code 1"), "{report}");
    assert!(report.contains("LinuxServer: Succeed"), "{report}");
    assert!(report.contains("Windows64: Succeed"), "{report}");

    // The failed target never uploaded.
    assert!(!farm.receive_root.path().join("P").join("Linux64").exists());
    assert!(farm.receive_root.path().join("P/Windows64/game.exe").exists());
}

#[tokio::test]
async fn request_for_busy_project_is_rejected() {
    let farm = Farm::start().await;
    let gate = Arc::new(Notify::new());
    let _mac = farm
        .add_runner("mac-mini", OsFamily::MacOs, &[("OSX", Behavior::Gated)], gate.clone())
        .await;

    let mut first = farm.client().await;
    first.request("P", &["OSX"]).await;
    assert!(first.response().await.accepted);

    let mut second = farm.client().await;
    second.request("P", &["OSX"]).await;
    let rejected = second.response().await;
    assert!(!rejected.accepted);
    assert!(rejected.message.contains("already active"), "{}", rejected.message);

    gate.notify_one();
    let report = first.report().await;
    assert!(report.contains("build succeeded"), "{report}");

    // Released once the run ended.
    second.request("P", &["OSX"]).await;
    assert!(second.response().await.accepted);
    gate.notify_one();
    assert!(second.report().await.contains("build succeeded"));
}

#[tokio::test]
async fn runner_disconnect_fails_its_targets() {
    let farm = Farm::start().await;
    let gate = Arc::new(Notify::new());
    let mac = farm
        .add_runner("mac-mini", OsFamily::MacOs, &[("OSX", Behavior::Hang)], gate.clone())
        .await;
    let _win = farm
        .add_runner("win-box", OsFamily::Windows, &[("Windows64", Behavior::Succeed)], gate)
        .await;

    let mut client = farm.client().await;
    client.request("P", &["OSX", "Windows64"]).await;
    assert!(client.response().await.accepted);

    // Windows64 is done and uploaded while OSX is still building.
    let uploaded = farm.receive_root.path().join("P/Windows64/game.exe");
    wait_for(|| farm.master.jobs().outstanding() == 1 && uploaded.exists()).await;
    mac.connection.close();

    let report = client.report().await;
    assert!(report.contains("OSX: Failed"), "{report}");
    assert!(report.contains("runner disconnected"), "{report}");
    assert!(report.contains("Windows64: Succeed"), "{report}");
}

#[tokio::test]
async fn shutdown_waits_for_running_pipelines() {
    let farm = Farm::start().await;
    let _mac = farm
        .add_runner("mac-mini", OsFamily::MacOs, &[("OSX", Behavior::Hang)], Arc::new(Notify::new()))
        .await;

    let mut client = farm.client().await;
    client.request("P", &["OSX"]).await;
    assert!(client.response().await.accepted);
    wait_for(|| farm.master.jobs().outstanding() == 1 && farm.master.running_pipelines() == 1).await;

    let shutdown = farm.master.shutdown();
    tokio::pin!(shutdown);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut shutdown)
            .await
            .is_err(),
        "shutdown returned while a pipeline was running"
    );

    farm.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), shutdown)
        .await
        .expect("pipeline did not stop after cancellation");
    assert_eq!(farm.master.running_pipelines(), 0);
}

#[tokio::test]
async fn target_without_runner_fails_immediately() {
    let farm = Farm::start().await;
    let mut client = farm.client().await;
    client.request("P", &["iOS"]).await;
    assert!(client.response().await.accepted);

    let report = client.report().await;
    assert!(report.contains("iOS: Failed"), "{report}");
    assert!(report.contains("no runner available"), "{report}");
}

#[tokio::test]
async fn malformed_request_is_answered() {
    let farm = Farm::start().await;
    let mut client = farm.client().await;
    client
        .connection
        .service("build")
        .send_json(&serde_json::json!({"Nope": true}))
        .await
        .unwrap();

    let response = client.response().await;
    assert!(!response.accepted);
    assert!(response.message.starts_with("malformed build request"));
    assert_eq!(
        farm.notifier.texts.lock().unwrap().len(),
        0,
        "no pipeline should have run"
    );
}
