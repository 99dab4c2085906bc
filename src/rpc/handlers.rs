//! Method handlers for the control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::{KeystoreError, OrchestratorError, RelayError};
use crate::keystore::{Keystore, StoredKey};
use crate::orchestrator::{ContainerManager, StartRequest};
use crate::relay::ChatRelay;
use crate::rpc::methods::*;
use crate::rpc::protocol::{ErrorCode, RpcError};

/// Largest decoded `attach_config` payload.
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

const DEFAULT_RECEIVE_LIMIT: usize = 10;
const DEFAULT_MSGTYPE: &str = "m.text";

/// Shared state behind every connection.
pub struct BridgeState {
    pub socket_path: PathBuf,
    pub configs_dir: PathBuf,
    pub keystore: Arc<dyn Keystore>,
    pub containers: ContainerManager,
    pub relay: Option<Arc<dyn ChatRelay>>,
}

impl BridgeState {
    /// Run one decoded call.
    pub async fn dispatch(&self, call: MethodCall) -> Result<Value, RpcError> {
        match call {
            MethodCall::Status => Ok(self.status().await),
            MethodCall::Health => Ok(json!({ "status": "healthy" })),
            MethodCall::Start(p) => self.start(p).await,
            MethodCall::Stop(p) => self.stop(p).await,
            MethodCall::ListKeys(p) => self.list_keys(p).await,
            MethodCall::GetKey(p) => self.get_key(p).await,
            MethodCall::StoreKey(p) => self.store_key(p).await,
            MethodCall::DeleteKey(p) => self.delete_key(p).await,
            MethodCall::MatrixStatus => Ok(self.matrix_status().await),
            MethodCall::MatrixLogin(p) => self.matrix_login(p).await,
            MethodCall::MatrixSend(p) => self.matrix_send(p).await,
            MethodCall::MatrixReceive(p) => self.matrix_receive(p).await,
            MethodCall::MatrixRefreshToken => self.matrix_refresh().await,
            MethodCall::AttachConfig(p) => self.attach_config(p).await,
            MethodCall::ListConfigs => self.list_configs().await,
            MethodCall::SendSecret(p) => self.send_secret(p).await,
        }
    }

    async fn status(&self) -> Value {
        let ids = self.containers.registry().ids().await;
        json!({
            "version": crate::VERSION,
            "state": "running",
            "socket": self.socket_path.display().to_string(),
            "containers": ids.len(),
            "container_ids": ids,
        })
    }

    // ── Containers ───────────────────────────────────────────────────────

    async fn start(&self, params: StartParams) -> Result<Value, RpcError> {
        if params.key_id.trim().is_empty() {
            return Err(RpcError::invalid_params("key_id is required"));
        }
        let record = self
            .containers
            .start(StartRequest {
                key_id: params.key_id,
                agent_type: params.agent_type.filter(|s| !s.is_empty()),
                image: params.image.filter(|s| !s.is_empty()),
            })
            .await
            .map_err(orchestrator_error)?;

        Ok(json!({
            "container_id": record.container_id,
            "container_name": record.name,
            "status": record.state.to_string(),
            "endpoint": record.endpoint,
        }))
    }

    async fn stop(&self, params: StopParams) -> Result<Value, RpcError> {
        let record = self
            .containers
            .stop(&params.container_id)
            .await
            .map_err(orchestrator_error)?;
        Ok(json!({
            "status": record.state.to_string(),
            "container_id": record.container_id,
            "container_name": record.name,
        }))
    }

    async fn send_secret(&self, params: SendSecretParams) -> Result<Value, RpcError> {
        self.containers
            .send_secret(&params.container_id, &params.key_id)
            .await
            .map_err(orchestrator_error)?;
        Ok(json!({
            "status": "secrets_sent",
            "container_id": params.container_id,
            "key_id": params.key_id,
        }))
    }

    // ── Keys ─────────────────────────────────────────────────────────────

    async fn list_keys(&self, params: ListKeysParams) -> Result<Value, RpcError> {
        let provider = params.provider.filter(|p| !p.is_empty());
        let keys = self
            .keystore
            .list(provider.as_deref())
            .await
            .map_err(keystore_error)?;
        serde_json::to_value(keys).map_err(|e| RpcError::internal(e.to_string()))
    }

    async fn get_key(&self, params: KeyIdParams) -> Result<Value, RpcError> {
        let key = self
            .keystore
            .retrieve(&params.id)
            .await
            .map_err(keystore_error)?;
        tracing::info!(key_id = %key.id, provider = %key.provider, "Key retrieved over control plane");
        Ok(json!({
            "id": key.id,
            "provider": key.provider,
            "token": key.token.expose_secret(),
            "display_name": key.display_name,
            "created_at": key.created_at,
            "expires_at": key.expires_at,
            "tags": key.tags,
        }))
    }

    async fn store_key(&self, params: StoreKeyParams) -> Result<Value, RpcError> {
        let key = StoredKey {
            id: params.id,
            provider: params.provider,
            token: SecretString::from(params.token),
            display_name: params.display_name.unwrap_or_default(),
            created_at: Utc::now().timestamp(),
            expires_at: params.expires_at.unwrap_or(0),
            tags: params.tags,
        };
        let info = self.keystore.store(key).await.map_err(keystore_error)?;
        Ok(json!({
            "id": info.id,
            "provider": info.provider,
            "created_at": info.created_at,
        }))
    }

    async fn delete_key(&self, params: KeyIdParams) -> Result<Value, RpcError> {
        self.keystore
            .delete(&params.id)
            .await
            .map_err(keystore_error)?;
        Ok(json!({ "status": "deleted", "id": params.id }))
    }

    // ── Matrix ───────────────────────────────────────────────────────────

    fn relay(&self) -> Result<&Arc<dyn ChatRelay>, RpcError> {
        self.relay.as_ref().ok_or_else(|| relay_error(RelayError::NotConfigured))
    }

    async fn matrix_status(&self) -> Value {
        let Some(relay) = self.relay.as_ref() else {
            return json!({ "enabled": false, "status": "not_configured" });
        };
        let status = relay.status().await;
        json!({
            "enabled": true,
            "status": if status.connected { "connected" } else { "disconnected" },
            "user_id": status.user_id.unwrap_or_default(),
            "logged_in": status.logged_in,
        })
    }

    async fn matrix_login(&self, params: MatrixLoginParams) -> Result<Value, RpcError> {
        if params.username.is_empty() || params.password.is_empty() {
            return Err(RpcError::invalid_params("username and password are required"));
        }
        let user_id = self
            .relay()?
            .login(&params.username, SecretString::from(params.password))
            .await
            .map_err(relay_error)?;
        Ok(json!({ "status": "logged_in", "user_id": user_id }))
    }

    async fn matrix_send(&self, params: MatrixSendParams) -> Result<Value, RpcError> {
        if params.room_id.is_empty() || params.message.is_empty() {
            return Err(RpcError::invalid_params("room_id and message are required"));
        }
        let msgtype = params
            .msgtype
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MSGTYPE.to_string());
        let event_id = self
            .relay()?
            .send(&params.room_id, &params.message, &msgtype)
            .await
            .map_err(relay_error)?;
        Ok(json!({ "event_id": event_id, "room_id": params.room_id }))
    }

    async fn matrix_receive(&self, params: MatrixReceiveParams) -> Result<Value, RpcError> {
        let limit = params
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_RECEIVE_LIMIT);
        let events = self
            .relay()?
            .receive(limit)
            .await
            .map_err(relay_error)?;
        let count = events.len();
        Ok(json!({ "events": events, "count": count }))
    }

    async fn matrix_refresh(&self) -> Result<Value, RpcError> {
        let user_id = self
            .relay()?
            .refresh_token()
            .await
            .map_err(relay_error)?;
        Ok(json!({ "status": "refreshed", "user_id": user_id }))
    }

    // ── Configs ──────────────────────────────────────────────────────────

    async fn attach_config(&self, params: AttachConfigParams) -> Result<Value, RpcError> {
        if !is_clean_relative(&params.name) {
            return Err(RpcError::invalid_params(
                "name must be a clean relative path",
            ));
        }
        let encoding = params
            .encoding
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "raw".to_string());
        let bytes = match encoding.as_str() {
            "raw" => params.content.into_bytes(),
            "base64" => base64::engine::general_purpose::STANDARD
                .decode(params.content.as_bytes())
                .map_err(|e| {
                    RpcError::invalid_params(format!("failed to decode base64 content: {e}"))
                })?,
            other => {
                return Err(RpcError::invalid_params(format!(
                    "unsupported encoding: {other} (expected raw or base64)"
                )));
            }
        };
        if bytes.len() > MAX_CONFIG_SIZE {
            return Err(RpcError::invalid_params(format!(
                "config content too large (max {} MB)",
                MAX_CONFIG_SIZE / (1024 * 1024)
            )));
        }

        let path = self.configs_dir.join(&params.name);
        write_config(&path, &bytes)
            .await
            .map_err(|e| RpcError::internal(format!("failed to write config file: {e}")))?;

        let config_type = params
            .config_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| infer_config_type(&params.name).to_string());
        tracing::info!(name = %params.name, size = bytes.len(), "Attached config");

        let mut result = json!({
            "config_id": format!("config-{}-{}", params.name, Utc::now().timestamp()),
            "name": params.name,
            "path": path.display().to_string(),
            "size": bytes.len(),
            "type": config_type,
            "encoding": encoding,
        });
        if let Some(metadata) = params.metadata {
            result["metadata"] = Value::Object(metadata);
        }
        Ok(result)
    }

    async fn list_configs(&self) -> Result<Value, RpcError> {
        let mut entries = match tokio::fs::read_dir(&self.configs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(json!([])),
            Err(e) => {
                return Err(RpcError::internal(format!(
                    "failed to read configs directory: {e}"
                )));
            }
        };

        let mut configs = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Stopped listing configs early");
                    break;
                }
            };
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            configs.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "path": entry.path().display().to_string(),
                "size": meta.len(),
                "modified": modified,
            }));
        }
        configs.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(Value::Array(configs))
    }
}

/// Relative, and unchanged by path cleaning: no `.`/`..` segments, no empty
/// segments, no leading or trailing slash.
fn is_clean_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Type from the final extension. A bare dotfile such as `.env` counts as
/// its own extension.
fn infer_config_type(name: &str) -> &'static str {
    let file_name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    match file_name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("env") => "env",
        Some("toml") => "toml",
        Some("yaml" | "yml") => "yaml",
        Some("json") => "json",
        _ => "file",
    }
}

async fn write_config(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(parent)
            .await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o640)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    // An existing file keeps its old mode through open(); force it.
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640)).await
}

fn keystore_error(e: KeystoreError) -> RpcError {
    match e {
        KeystoreError::NotFound(_) | KeystoreError::Expired(_) => {
            RpcError::new(ErrorCode::KeyNotFound, e.to_string())
        }
        KeystoreError::InvalidProvider(_)
        | KeystoreError::MissingField(_)
        | KeystoreError::Duplicate(_) => RpcError::invalid_params(e.to_string()),
    }
}

fn orchestrator_error(e: OrchestratorError) -> RpcError {
    match e {
        OrchestratorError::Keystore(inner) => keystore_error(inner),
        OrchestratorError::ContainerNotFound { .. } => {
            RpcError::new(ErrorCode::ContainerStopped, e.to_string())
        }
        other => RpcError::internal(other.to_string()),
    }
}

fn relay_error(e: RelayError) -> RpcError {
    RpcError::internal(e.to_string())
}
