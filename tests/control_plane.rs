//! End-to-end tests for the control plane.
//!
//! A real server on a temp socket, driven through `BridgeClient`, backed by an
//! in-memory keystore, a simulated container runtime whose "containers"
//! connect to their secret endpoint like the bootstrap does, and a scripted
//! chat relay.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, oneshot};

use armorclaw::client::BridgeClient;
use armorclaw::config::BridgeConfig;
use armorclaw::error::{ClientError, OrchestratorError, RelayError};
use armorclaw::keystore::{InMemoryKeystore, Keystore, StoredKey};
use armorclaw::orchestrator::{ContainerManager, ContainerRuntime, LaunchSpec};
use armorclaw::relay::{ChatRelay, RelayEvent, RelayStatus};
use armorclaw::rpc::{BridgeServer, BridgeState};
use armorclaw::secrets::{
    Credential, ENDPOINT_FILE, ProviderTable, SecretInjector, UPDATE_ENDPOINT_PREFIX, receive_from,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const SECRETS_MOUNT: &str = ":/run/armorclaw/secrets:ro";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// The container reads its secret right after launch.
    Deliver,
    /// The container starts but never connects.
    Silent,
    /// The runtime refuses to create the container.
    FailLaunch,
}

struct SimulatedRuntime {
    behavior: Behavior,
    launched: Mutex<Vec<LaunchSpec>>,
    removed: Mutex<Vec<String>>,
    received: Arc<Mutex<Vec<Credential>>>,
    counter: AtomicUsize,
}

impl SimulatedRuntime {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            launched: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            received: Arc::new(Mutex::new(Vec::new())),
            counter: AtomicUsize::new(0),
        }
    }
}

fn host_secret_dir(spec: &LaunchSpec) -> PathBuf {
    spec.binds
        .iter()
        .find_map(|b| b.strip_suffix(SECRETS_MOUNT))
        .map(PathBuf::from)
        .expect("secrets bind mount")
}

fn update_endpoint(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(UPDATE_ENDPOINT_PREFIX))
        })
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, OrchestratorError> {
        if self.behavior == Behavior::FailLaunch {
            return Err(OrchestratorError::ContainerCreationFailed {
                name: spec.name.clone(),
                reason: "image not found".to_string(),
            });
        }
        self.launched.lock().await.push(spec.clone());
        let id = format!("ctr-{}", self.counter.fetch_add(1, Ordering::SeqCst));

        if self.behavior == Behavior::Deliver {
            let endpoint = host_secret_dir(spec).join(ENDPOINT_FILE);
            let received = Arc::clone(&self.received);
            tokio::spawn(async move {
                if let Ok(credential) = receive_from(&endpoint, TIMEOUT).await {
                    received.lock().await.push(credential);
                }
            });
        }
        Ok(id)
    }

    async fn remove(&self, container_id: &str) -> Result<(), OrchestratorError> {
        self.removed.lock().await.push(container_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedRelay {
    user: Mutex<Option<String>>,
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ChatRelay for ScriptedRelay {
    async fn status(&self) -> RelayStatus {
        let user = self.user.lock().await.clone();
        RelayStatus {
            connected: true,
            logged_in: user.is_some(),
            user_id: user,
        }
    }

    async fn login(&self, username: &str, password: SecretString) -> Result<String, RelayError> {
        if password.expose_secret() != "correct horse" {
            return Err(RelayError::Rejected {
                context: "login",
                status: 403,
                errcode: "M_FORBIDDEN".to_string(),
            });
        }
        let user_id = format!("@{username}:example.org");
        *self.user.lock().await = Some(user_id.clone());
        Ok(user_id)
    }

    async fn send(&self, room_id: &str, message: &str, msgtype: &str) -> Result<String, RelayError> {
        if self.user.lock().await.is_none() {
            return Err(RelayError::NotLoggedIn);
        }
        let mut sent = self.sent.lock().await;
        sent.push((room_id.to_string(), message.to_string(), msgtype.to_string()));
        Ok(format!("$event{}", sent.len()))
    }

    async fn receive(&self, limit: usize) -> Result<Vec<RelayEvent>, RelayError> {
        let sent = self.sent.lock().await;
        Ok(sent
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, (room, body, msgtype))| RelayEvent {
                event_type: "m.room.message".to_string(),
                room_id: room.clone(),
                sender: "@peer:example.org".to_string(),
                event_id: format!("$in{i}"),
                content: json!({ "msgtype": msgtype, "body": body }),
            })
            .collect())
    }

    async fn refresh_token(&self) -> Result<String, RelayError> {
        self.user.lock().await.clone().ok_or(RelayError::NotLoggedIn)
    }
}

struct Harness {
    dir: TempDir,
    socket: PathBuf,
    client: BridgeClient,
    runtime: Arc<SimulatedRuntime>,
    state: Arc<BridgeState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Harness {
    async fn start(behavior: Behavior, relay: Option<Arc<dyn ChatRelay>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::rooted_at(dir.path());
        config.secrets.timeout = Duration::from_millis(400);

        let keystore: Arc<dyn Keystore> =
            Arc::new(InMemoryKeystore::new(ProviderTable::standard()));
        keystore
            .store(StoredKey::new("openai-main", "openai", "sk-test-123"))
            .await
            .unwrap();
        keystore
            .store(StoredKey::new("anthropic-alt", "Anthropic", "sk-ant-456"))
            .await
            .unwrap();

        let runtime = Arc::new(SimulatedRuntime::new(behavior));
        let injector = Arc::new(SecretInjector::new(&config.secrets));
        let containers = ContainerManager::new(
            config.containers.clone(),
            config.server.socket_path.clone(),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            injector,
            Arc::clone(&keystore),
        );
        let state = Arc::new(BridgeState {
            socket_path: config.server.socket_path.clone(),
            configs_dir: config.server.configs_dir.clone(),
            keystore,
            containers,
            relay,
        });

        let server = BridgeServer::bind(&config.server.socket_path, Arc::clone(&state)).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));

        Self {
            socket: config.server.socket_path.clone(),
            client: BridgeClient::new(&config.server.socket_path).with_timeout(TIMEOUT),
            dir,
            runtime,
            state,
            shutdown: Some(tx),
            server,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(TIMEOUT, self.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!self.socket.exists());
    }
}

fn rpc_code(err: ClientError) -> i32 {
    match err {
        ClientError::Rpc { code, .. } => code,
        other => panic!("expected an RPC error, got {other:?}"),
    }
}

/// Write raw bytes on one connection and read one response line.
async fn raw_exchange(socket: &Path, bytes: &[u8]) -> Value {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer.write_all(bytes).await.unwrap();
    let mut line = String::new();
    tokio::time::timeout(TIMEOUT, BufReader::new(reader).read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_status_and_health_on_idle_bridge() {
    let h = Harness::start(Behavior::Deliver, None).await;

    assert!(h.client.health().await.unwrap());
    let status = h.client.status().await.unwrap();
    assert_eq!(status.version, "1.0.0");
    assert_eq!(status.state, "running");
    assert_eq!(status.containers, 0);
    assert_eq!(PathBuf::from(&status.socket), h.socket);

    h.stop().await;
}

#[tokio::test]
async fn test_start_injects_before_launch_and_delivers_once() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let started = h
        .client
        .start_container("openai-main", None, None)
        .await
        .unwrap();
    assert_eq!(started.status, "running");
    assert_eq!(started.endpoint, "/run/armorclaw/bridge.sock");
    assert!(started.container_name.starts_with("armorclaw-openai-main-"));

    let received = h.runtime.received.lock().await.clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].provider, "openai");
    assert_eq!(received[0].token, "sk-test-123");

    let launched = h.runtime.launched.lock().await.clone();
    let spec = &launched[0];
    assert_eq!(spec.env_value("ARMORCLAW_KEY_ID"), Some("openai-main"));
    assert_eq!(
        spec.env_value("ARMORCLAW_BRIDGE_SOCKET"),
        Some("/run/armorclaw/bridge.sock")
    );
    assert_eq!(
        spec.env_value("ARMORCLAW_SECRET_SOCKET"),
        Some("/run/armorclaw/secrets/secret.sock")
    );
    assert!(spec.env.iter().all(|e| !e.contains("sk-test-123")));

    // Endpoint is gone after delivery: a second read finds nothing.
    let endpoint = host_secret_dir(spec).join(ENDPOINT_FILE);
    assert!(!endpoint.exists());
    assert_eq!(h.state.containers.injector().pending_count().await, 0);

    let status = h.client.status().await.unwrap();
    assert_eq!(status.container_ids, vec![started.container_id.clone()]);

    h.stop().await;
}

#[tokio::test]
async fn test_start_with_unknown_key_never_launches() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let err = h
        .client
        .start_container("missing-key", None, None)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -3);
    assert!(h.runtime.launched.lock().await.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_start_rolls_back_when_container_never_connects() {
    let h = Harness::start(Behavior::Silent, None).await;

    let err = h
        .client
        .start_container("openai-main", None, None)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -32603);

    let launched = h.runtime.launched.lock().await.clone();
    assert_eq!(launched.len(), 1);
    assert_eq!(*h.runtime.removed.lock().await, vec!["ctr-0".to_string()]);
    assert!(!host_secret_dir(&launched[0]).exists());
    assert!(h.state.containers.registry().is_empty().await);

    h.stop().await;
}

#[tokio::test]
async fn test_start_fails_cleanly_when_launch_fails() {
    let h = Harness::start(Behavior::FailLaunch, None).await;

    let err = h
        .client
        .start_container("openai-main", None, Some("armorclaw/agent:missing"))
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -32603);
    assert_eq!(h.state.containers.injector().pending_count().await, 0);

    let secrets_dir = h.dir.path().join("secrets");
    let leftovers = std::fs::read_dir(&secrets_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    h.stop().await;
}

#[tokio::test]
async fn test_stop_known_and_unknown_containers() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let err = h.client.stop_container("ctr-404").await.unwrap_err();
    assert_eq!(rpc_code(err), -2);

    let started = h
        .client
        .start_container("openai-main", None, None)
        .await
        .unwrap();
    let stopped = h
        .client
        .stop_container(&started.container_id)
        .await
        .unwrap();
    assert_eq!(stopped["status"], "stopped");
    assert_eq!(stopped["container_id"], started.container_id.as_str());
    assert_eq!(h.client.status().await.unwrap().containers, 0);
    assert!(
        h.runtime
            .removed
            .lock()
            .await
            .contains(&started.container_id)
    );

    h.stop().await;
}

#[tokio::test]
async fn test_send_secret_redelivers_to_running_container() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let started = h
        .client
        .start_container("openai-main", None, None)
        .await
        .unwrap();
    let secret_dir = host_secret_dir(&h.runtime.launched.lock().await[0]);

    // The running agent watches its mounted directory for the update endpoint.
    let reader = tokio::spawn(async move {
        loop {
            if let Some(endpoint) = update_endpoint(&secret_dir)
                && let Ok(credential) = receive_from(&endpoint, TIMEOUT).await
            {
                return (endpoint, credential);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let result = h
        .client
        .send_secret(&started.container_id, "anthropic-alt")
        .await
        .unwrap();
    assert_eq!(result["status"], "secrets_sent");

    let (endpoint, credential) = tokio::time::timeout(TIMEOUT, reader).await.unwrap().unwrap();
    assert!(!endpoint.ends_with(ENDPOINT_FILE));
    assert!(!endpoint.exists());
    assert_eq!(credential.provider, "anthropic");
    assert_eq!(credential.token, "sk-ant-456");

    let err = h
        .client
        .send_secret("ctr-404", "anthropic-alt")
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -2);

    h.stop().await;
}

#[tokio::test]
async fn test_key_lifecycle_over_rpc() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let token = SecretString::from("xoxb-live".to_string());
    h.client
        .store_key("slack-bot", "slack", &token, Some("Team bot"))
        .await
        .unwrap();

    let err = h
        .client
        .store_key("mystery", "mistral", &token, None)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -32602);

    let slack_keys = h.client.list_keys(Some("slack")).await.unwrap();
    assert_eq!(slack_keys.len(), 1);
    assert_eq!(slack_keys[0].display_name, "Team bot");
    let raw = h.client.call("list_keys", None).await.unwrap();
    assert!(!raw.to_string().contains("xoxb-live"));
    assert!(!raw.to_string().contains("sk-test-123"));

    let key = h.client.get_key("slack-bot").await.unwrap();
    assert_eq!(key.token.expose_secret(), "xoxb-live");

    let deleted = h
        .client
        .call("delete_key", Some(json!({ "id": "slack-bot" })))
        .await
        .unwrap();
    assert_eq!(deleted["status"], "deleted");
    assert_eq!(rpc_code(h.client.get_key("slack-bot").await.unwrap_err()), -3);

    h.stop().await;
}

#[tokio::test]
async fn test_protocol_errors() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let err = h.client.call("containers.nuke", None).await.unwrap_err();
    assert_eq!(rpc_code(err), -32601);

    let err = h
        .client
        .call("get_key", Some(json!({ "key": "openai-main" })))
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -32602);

    let parse = raw_exchange(&h.socket, b"{not json}\n").await;
    assert_eq!(parse["error"]["code"], -32700);
    assert!(parse["id"].is_null());

    let version = raw_exchange(&h.socket, b"{\"jsonrpc\":\"1.0\",\"id\":9,\"method\":\"health\"}\n").await;
    assert_eq!(version["error"]["code"], -32600);
    assert_eq!(version["id"], 9);

    h.stop().await;
}

#[tokio::test]
async fn test_pipelined_requests_on_one_connection() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let stream = UnixStream::connect(&h.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"health\"}\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"status\"}\n",
        )
        .await
        .unwrap();

    let mut lines = BufReader::new(reader).lines();
    let first: Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    let second: Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["id"], 1);
    assert_eq!(first["result"]["status"], "healthy");
    assert_eq!(second["id"], 2);
    assert_eq!(second["result"]["state"], "running");

    drop(writer);
    h.stop().await;
}

#[tokio::test]
async fn test_attach_and_list_configs() {
    let h = Harness::start(Behavior::Deliver, None).await;

    assert!(h.client.list_configs().await.unwrap().is_empty());

    let attached = h
        .client
        .attach_config("agent.env", "MODEL=gpt-4o\n", None)
        .await
        .unwrap();
    assert_eq!(attached["type"], "env");
    assert_eq!(attached["size"], 13);
    assert!(
        attached["config_id"]
            .as_str()
            .unwrap()
            .starts_with("config-agent.env-")
    );
    let written = std::fs::read_to_string(h.dir.path().join("configs/agent.env")).unwrap();
    assert_eq!(written, "MODEL=gpt-4o\n");

    let encoded = h
        .client
        .call(
            "attach_config",
            Some(json!({ "name": "limits.json", "content": "eyJhIjoxfQ==", "encoding": "base64" })),
        )
        .await
        .unwrap();
    assert_eq!(encoded["type"], "json");
    assert_eq!(encoded["size"], 7);

    for content in ["A=1\n", "A=2\n"] {
        let dotenv = h.client.attach_config(".env", content, None).await.unwrap();
        assert_eq!(dotenv["type"], "env");
    }
    let dotenv_path = h.dir.path().join("configs/.env");
    assert_eq!(std::fs::read_to_string(&dotenv_path).unwrap(), "A=2\n");
    let mode = std::fs::metadata(&dotenv_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);

    let err = h
        .client
        .attach_config("../escape.env", "X=1", None)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -32602);

    let configs = h.client.list_configs().await.unwrap();
    let names: Vec<_> = configs.iter().map(|c| c["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec![".env", "agent.env", "limits.json"]);

    h.stop().await;
}

#[tokio::test]
async fn test_matrix_methods_without_relay() {
    let h = Harness::start(Behavior::Deliver, None).await;

    let status = h.client.matrix_status().await.unwrap();
    assert_eq!(status["enabled"], false);
    assert_eq!(status["status"], "not_configured");

    let err = h
        .client
        .matrix_send("!room:example.org", "hello")
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc { code, message } => {
            assert_eq!(code, -32603);
            assert!(message.contains("matrix not configured"));
        }
        other => panic!("unexpected {other:?}"),
    }

    h.stop().await;
}

#[tokio::test]
async fn test_matrix_methods_with_relay() {
    let relay: Arc<dyn ChatRelay> = Arc::new(ScriptedRelay::default());
    let h = Harness::start(Behavior::Deliver, Some(relay)).await;

    let err = h
        .client
        .matrix_login("bridge", &SecretString::from("wrong".to_string()))
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err), -32603);

    let login = h
        .client
        .matrix_login("bridge", &SecretString::from("correct horse".to_string()))
        .await
        .unwrap();
    assert_eq!(login["user_id"], "@bridge:example.org");

    let status = h.client.matrix_status().await.unwrap();
    assert_eq!(status["status"], "connected");
    assert_eq!(status["logged_in"], true);

    let event_id = h
        .client
        .matrix_send("!room:example.org", "hello")
        .await
        .unwrap();
    assert_eq!(event_id, "$event1");

    let received = h.client.matrix_receive(Some(5)).await.unwrap();
    assert_eq!(received["count"], 1);
    assert_eq!(received["events"][0]["content"]["msgtype"], "m.text");
    assert_eq!(received["events"][0]["type"], "m.room.message");

    let refreshed = h.client.call("matrix.refresh_token", None).await.unwrap();
    assert_eq!(refreshed["status"], "refreshed");

    h.stop().await;
}

#[tokio::test]
async fn test_client_reports_missing_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let client = BridgeClient::new(dir.path().join("bridge.sock"));
    let err = client.status().await.unwrap_err();
    assert!(matches!(err, ClientError::SocketNotFound { .. }));
}
