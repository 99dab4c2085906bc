//! Typed method calls.
//!
//! Every request is decoded into one [`MethodCall`] variant before it reaches
//! a handler, so missing or mistyped params fail at the boundary with
//! `InvalidParams` and unknown names with `MethodNotFound`.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::protocol::{ErrorCode, RpcError};

#[derive(Debug, Clone, Deserialize)]
pub struct StartParams {
    pub key_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopParams {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListKeysParams {
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyIdParams {
    pub id: String,
}

#[derive(Clone, Deserialize)]
pub struct StoreKeyParams {
    pub id: String,
    pub provider: String,
    pub token: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl std::fmt::Debug for StoreKeyParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreKeyParams")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct MatrixLoginParams {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for MatrixLoginParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixLoginParams")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatrixSendParams {
    pub room_id: String,
    pub message: String,
    #[serde(default)]
    pub msgtype: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatrixReceiveParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachConfigParams {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default, rename = "type")]
    pub config_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendSecretParams {
    pub container_id: String,
    pub key_id: String,
}

/// The closed set of control-plane calls.
#[derive(Debug, Clone)]
pub enum MethodCall {
    Status,
    Health,
    Start(StartParams),
    Stop(StopParams),
    ListKeys(ListKeysParams),
    GetKey(KeyIdParams),
    StoreKey(StoreKeyParams),
    DeleteKey(KeyIdParams),
    MatrixStatus,
    MatrixLogin(MatrixLoginParams),
    MatrixSend(MatrixSendParams),
    MatrixReceive(MatrixReceiveParams),
    MatrixRefreshToken,
    AttachConfig(AttachConfigParams),
    ListConfigs,
    SendSecret(SendSecretParams),
}

impl MethodCall {
    /// Decode a method name and its raw params.
    pub fn parse(method: &str, params: Option<Value>) -> Result<Self, RpcError> {
        Ok(match method {
            "status" => Self::Status,
            "health" => Self::Health,
            "start" => Self::Start(required(params)?),
            "stop" => Self::Stop(required(params)?),
            "list_keys" => Self::ListKeys(optional(params)?),
            "get_key" => Self::GetKey(required(params)?),
            "store_key" => Self::StoreKey(required(params)?),
            "delete_key" => Self::DeleteKey(required(params)?),
            "matrix.status" => Self::MatrixStatus,
            "matrix.login" => Self::MatrixLogin(required(params)?),
            "matrix.send" => Self::MatrixSend(required(params)?),
            "matrix.receive" => Self::MatrixReceive(optional(params)?),
            "matrix.refresh_token" => Self::MatrixRefreshToken,
            "attach_config" => Self::AttachConfig(required(params)?),
            "list_configs" => Self::ListConfigs,
            "send_secret" => Self::SendSecret(required(params)?),
            other => {
                return Err(RpcError::new(
                    ErrorCode::MethodNotFound,
                    format!("method not found: {other}"),
                ));
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Health => "health",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::ListKeys(_) => "list_keys",
            Self::GetKey(_) => "get_key",
            Self::StoreKey(_) => "store_key",
            Self::DeleteKey(_) => "delete_key",
            Self::MatrixStatus => "matrix.status",
            Self::MatrixLogin(_) => "matrix.login",
            Self::MatrixSend(_) => "matrix.send",
            Self::MatrixReceive(_) => "matrix.receive",
            Self::MatrixRefreshToken => "matrix.refresh_token",
            Self::AttachConfig(_) => "attach_config",
            Self::ListConfigs => "list_configs",
            Self::SendSecret(_) => "send_secret",
        }
    }
}

fn required<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = params.ok_or_else(|| RpcError::invalid_params("params are required"))?;
    decode(params)
}

fn optional<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => decode(params),
    }
}

/// serde quotes mistyped string values in its message; those are dropped so a
/// token sent in the wrong slot never comes back in an error.
fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| {
        let detail = e.to_string();
        let detail = if detail.contains(": string \"") {
            "invalid type for a parameter".to_string()
        } else {
            detail
        };
        RpcError::invalid_params(format!("invalid params: {detail}"))
    })
}
