//! Control-plane client.
//!
//! Used by the agent inside a container (and by `armorclaw-bridge call`) to
//! talk to the bridge. Every call opens its own connection, writes one
//! newline-terminated request and reads until a complete JSON response
//! parses, all bounded by the per-call timeout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::ClientError;
use crate::keystore::KeyInfo;
use crate::rpc::protocol::{Request, Response};

pub const BRIDGE_SOCKET_VAR: &str = "ARMORCLAW_BRIDGE_SOCKET";
pub const DEFAULT_BRIDGE_SOCKET: &str = "/run/armorclaw/bridge.sock";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 4096;
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Result of `status`.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeStatus {
    pub version: String,
    pub state: String,
    pub socket: String,
    pub containers: usize,
    #[serde(default)]
    pub container_ids: Vec<String>,
}

/// Result of `start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartedContainer {
    pub container_id: String,
    pub container_name: String,
    pub status: String,
    pub endpoint: String,
}

/// Result of `get_key`.
pub struct KeyRecord {
    pub id: String,
    pub provider: String,
    pub token: SecretString,
    pub display_name: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub tags: Vec<String>,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct KeyRecordWire {
    id: String,
    provider: String,
    token: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    expires_at: i64,
    #[serde(default)]
    tags: Vec<String>,
}

impl From<KeyRecordWire> for KeyRecord {
    fn from(wire: KeyRecordWire) -> Self {
        Self {
            id: wire.id,
            provider: wire.provider,
            token: SecretString::from(wire.token),
            display_name: wire.display_name,
            created_at: wire.created_at,
            expires_at: wire.expires_at,
            tags: wire.tags,
        }
    }
}

/// Client for the bridge's control socket.
pub struct BridgeClient {
    socket_path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
}

impl BridgeClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    /// Socket from `ARMORCLAW_BRIDGE_SOCKET`, or the in-container default.
    pub fn from_env() -> Self {
        let path = std::env::var(BRIDGE_SOCKET_VAR)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_BRIDGE_SOCKET.to_string());
        Self::new(path)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and return its `result`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let mut payload =
            serde_json::to_vec(&request).map_err(|e| ClientError::Decode(e.to_string()))?;
        payload.push(b'\n');

        let response = tokio::time::timeout(self.timeout, self.exchange(&payload))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        if response.id != Value::from(id) {
            return Err(ClientError::Decode(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// [`call`](Self::call) and decode the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| ClientError::Decode(format!("unexpected {method} result: {e}")))
    }

    pub async fn status(&self) -> Result<BridgeStatus, ClientError> {
        self.call_as("status", None).await
    }

    /// True when the bridge reports itself healthy.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let result = self.call("health", None).await?;
        Ok(result.get("status").and_then(Value::as_str) == Some("healthy"))
    }

    pub async fn start_container(
        &self,
        key_id: &str,
        agent_type: Option<&str>,
        image: Option<&str>,
    ) -> Result<StartedContainer, ClientError> {
        let mut params = json!({ "key_id": key_id });
        if let Some(agent_type) = agent_type {
            params["agent_type"] = json!(agent_type);
        }
        if let Some(image) = image {
            params["image"] = json!(image);
        }
        self.call_as("start", Some(params)).await
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<Value, ClientError> {
        self.call("stop", Some(json!({ "container_id": container_id })))
            .await
    }

    pub async fn list_keys(&self, provider: Option<&str>) -> Result<Vec<KeyInfo>, ClientError> {
        let params = provider.map(|p| json!({ "provider": p }));
        self.call_as("list_keys", params).await
    }

    pub async fn get_key(&self, id: &str) -> Result<KeyRecord, ClientError> {
        let wire: KeyRecordWire = self.call_as("get_key", Some(json!({ "id": id }))).await?;
        Ok(wire.into())
    }

    pub async fn store_key(
        &self,
        id: &str,
        provider: &str,
        token: &SecretString,
        display_name: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut params = json!({
            "id": id,
            "provider": provider,
            "token": token.expose_secret(),
        });
        if let Some(name) = display_name {
            params["display_name"] = json!(name);
        }
        self.call("store_key", Some(params)).await
    }

    pub async fn matrix_status(&self) -> Result<Value, ClientError> {
        self.call("matrix.status", None).await
    }

    pub async fn matrix_login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Value, ClientError> {
        self.call(
            "matrix.login",
            Some(json!({ "username": username, "password": password.expose_secret() })),
        )
        .await
    }

    /// Returns the event id of the sent message.
    pub async fn matrix_send(&self, room_id: &str, message: &str) -> Result<String, ClientError> {
        let result = self
            .call(
                "matrix.send",
                Some(json!({ "room_id": room_id, "message": message })),
            )
            .await?;
        result
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("matrix.send result has no event_id".to_string()))
    }

    pub async fn matrix_receive(&self, limit: Option<usize>) -> Result<Value, ClientError> {
        let params = limit.map(|limit| json!({ "limit": limit }));
        self.call("matrix.receive", params).await
    }

    pub async fn attach_config(
        &self,
        name: &str,
        content: &str,
        config_type: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut params = json!({ "name": name, "content": content, "encoding": "raw" });
        if let Some(config_type) = config_type {
            params["type"] = json!(config_type);
        }
        self.call("attach_config", Some(params)).await
    }

    pub async fn list_configs(&self) -> Result<Vec<Value>, ClientError> {
        self.call_as("list_configs", None).await
    }

    pub async fn send_secret(&self, container_id: &str, key_id: &str) -> Result<Value, ClientError> {
        self.call(
            "send_secret",
            Some(json!({ "container_id": container_id, "key_id": key_id })),
        )
        .await
    }

    async fn exchange(&self, payload: &[u8]) -> Result<Response, ClientError> {
        let mut stream = self.connect().await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        read_response(&mut stream).await
    }

    async fn connect(&self) -> Result<UnixStream, ClientError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ClientError::SocketNotFound {
                    path: self.socket_path.clone(),
                },
                std::io::ErrorKind::ConnectionRefused => ClientError::ConnectionRefused {
                    path: self.socket_path.clone(),
                },
                _ => ClientError::Io(e),
            })
    }
}

async fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                return serde_json::from_value(value)
                    .map_err(|e| ClientError::Decode(e.to_string()));
            }
            Some(Err(e)) if e.is_eof() => {}
            Some(Err(e)) => return Err(ClientError::Decode(e.to_string())),
            None => {}
        }
        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(ClientError::Decode("response too large".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Accept `count` connections; answer each request with `reply(request)`.
    fn serve<F>(listener: UnixListener, count: usize, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Value) -> Vec<u8> + Send + 'static,
    {
        tokio::spawn(async move {
            for _ in 0..count {
                let (stream, _) = listener.accept().await.unwrap();
                let (reader, mut writer) = stream.into_split();
                let mut line = String::new();
                tokio::io::BufReader::new(reader)
                    .read_line(&mut line)
                    .await
                    .unwrap();
                let request: Value = serde_json::from_str(&line).unwrap();
                writer.write_all(&reply(request)).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn test_ids_increase_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve(listener, 2, |req| {
            let body = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"seen": req["id"]}});
            format!("{body}\n").into_bytes()
        });

        let client = BridgeClient::new(&path).with_timeout(TIMEOUT);
        let first = client.call("health", None).await.unwrap();
        let second = client.call("health", None).await.unwrap();
        assert_eq!(first["seen"], 1);
        assert_eq!(second["seen"], 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_error_carries_code_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = serve(listener, 1, |req| {
            let body = json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -3, "message": "key not found: missing"},
            });
            format!("{body}\n").into_bytes()
        });

        let client = BridgeClient::new(&path).with_timeout(TIMEOUT);
        match client.get_key("missing").await.unwrap_err() {
            ClientError::Rpc { code, message } => {
                assert_eq!(code, -3);
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_without_newline_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = serve(listener, 1, |req| {
            json!({"jsonrpc": "2.0", "id": req["id"], "result": {"status": "healthy"}})
                .to_string()
                .into_bytes()
        });

        let client = BridgeClient::new(&path).with_timeout(TIMEOUT);
        assert!(client.health().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = BridgeClient::new(dir.path().join("absent.sock"));
        let err = client.call("status", None).await.unwrap_err();
        assert!(matches!(err, ClientError::SocketNotFound { .. }));
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_refused_when_nobody_listens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let client = BridgeClient::new(&path);
        let err = client.call("status", None).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_silent_bridge_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = BridgeClient::new(&path).with_timeout(Duration::from_millis(200));
        let err = client.call("status", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_closed_before_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = serve(listener, 1, |_| b"{\"jsonrpc\":\"2.0\",".to_vec());

        let client = BridgeClient::new(&path).with_timeout(TIMEOUT);
        let err = client.call("status", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }

    #[test]
    fn test_key_record_debug_redacts_token() {
        let record: KeyRecord = KeyRecordWire {
            id: "k1".to_string(),
            provider: "openai".to_string(),
            token: "sk-never-print".to_string(),
            display_name: String::new(),
            created_at: 0,
            expires_at: 0,
            tags: Vec::new(),
        }
        .into();
        assert!(!format!("{record:?}").contains("sk-never-print"));
        assert_eq!(record.token.expose_secret(), "sk-never-print");
    }
}
