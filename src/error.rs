//! Error types for every ArmorClaw subsystem.
//!
//! None of these render a token value. Variants that wrap a decode failure
//! carry only its position and category.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to parse configuration: {0}")]
    ParseError(String),
}

/// Transport and data errors on the framed secret channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("secret channel truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("secret envelope is malformed: {0}")]
    Malformed(String),

    #[error("secret channel timed out after {0:?}")]
    Timeout(Duration),

    #[error("credential is invalid: {0} must be a non-empty string")]
    CredentialInvalid(&'static str),

    #[error("secret envelope declares {len} bytes, limit is {max}")]
    Oversized { len: usize, max: usize },

    #[error("secret channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Build a `Malformed` error without echoing any payload content.
    pub fn from_json(e: &serde_json::Error) -> Self {
        Self::Malformed(format!(
            "{:?} error at line {} column {}",
            e.classify(),
            e.line(),
            e.column()
        ))
    }
}

/// Host-side injection errors.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("container {container} did not connect to its secret endpoint within {after:?}")]
    InjectionTimeout { container: String, after: Duration },

    #[error("a secret endpoint already exists for container {container}")]
    EndpointExists { container: String },

    #[error("failed to prepare secret endpoint {}: {source}", path.display())]
    Endpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret delivery failed: {0}")]
    Delivery(#[from] ChannelError),

    #[error("secret session for {container} was aborted")]
    Aborted { container: String },
}

/// Keystore errors.
#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key expired: {0}")]
    Expired(String),

    #[error("unsupported provider: {0}")]
    InvalidProvider(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("key already exists: {0}")]
    Duplicate(String),
}

/// Container orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("docker error: {reason}")]
    Docker { reason: String },

    #[error("failed to create container {name}: {reason}")]
    ContainerCreationFailed { name: String, reason: String },

    #[error("container not found: {container_id}")]
    ContainerNotFound { container_id: String },

    #[error("container limit reached ({max})")]
    LimitReached { max: usize },

    #[error(transparent)]
    Injection(#[from] InjectError),

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chat relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("matrix not configured")]
    NotConfigured,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("{context} request failed: {reason}")]
    Http { context: &'static str, reason: String },

    #[error("{context} rejected: status {status}, errcode {errcode}")]
    Rejected {
        context: &'static str,
        status: u16,
        errcode: String,
    },

    #[error("failed to decode {context} response: {reason}")]
    Decode { context: &'static str, reason: String },
}

/// Fatal bootstrap errors. Advisory steps never produce one of these.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("no credentials available from secret socket, secrets file or environment")]
    NoCredentials,

    #[error("command not found: {command} ({reason})")]
    CommandNotFound { command: String, reason: String },

    #[error("failed to exec {command}: {source}")]
    ExecFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoCredentials => 1,
            Self::CommandNotFound { .. } => 127,
            Self::ExecFailed { .. } => 1,
        }
    }
}

/// Control-plane client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("bridge socket not found: {}", path.display())]
    SocketNotFound { path: PathBuf },

    #[error("connection refused by bridge at {}", path.display())]
    ConnectionRefused { path: PathBuf },

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge did not answer within {0:?}")]
    Timeout(Duration),

    #[error("bridge closed the connection before a full response arrived")]
    Closed,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("invalid response from bridge: {0}")]
    Decode(String),
}

impl ClientError {
    /// True when the failure happened before any request reached the bridge.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::SocketNotFound { .. } | Self::ConnectionRefused { .. } | Self::Io(_)
        )
    }
}
