//! Configuration for the ArmorClaw bridge.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_SOCKET_PATH: &str = "/run/armorclaw/bridge.sock";
pub const DEFAULT_SECRETS_DIR: &str = "/run/armorclaw/secrets";
pub const DEFAULT_CONFIGS_DIR: &str = "/run/armorclaw/configs";
pub const DEFAULT_CONTAINER_DIR: &str = "/run/armorclaw/containers";
pub const DEFAULT_IMAGE: &str = "armorclaw/agent:v1";
pub const DEFAULT_AGENT_TYPE: &str = "openclaw";

/// Main configuration for the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub containers: ContainerConfig,
    pub secrets: SecretsConfig,
    pub matrix: Option<MatrixConfig>,
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            containers: ContainerConfig::from_env()?,
            secrets: SecretsConfig::from_env()?,
            matrix: MatrixConfig::from_env()?,
        })
    }

    /// Configuration rooted in a single directory, used by tests and local runs.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            server: ServerConfig {
                socket_path: root.join("bridge.sock"),
                configs_dir: root.join("configs"),
            },
            containers: ContainerConfig {
                container_dir: root.join("containers"),
                ..ContainerConfig::default()
            },
            secrets: SecretsConfig {
                socket_dir: root.join("secrets"),
                ..SecretsConfig::default()
            },
            matrix: None,
        }
    }
}

/// Control-plane server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Long-lived control socket.
    pub socket_path: PathBuf,
    /// Target directory for `attach_config`.
    pub configs_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            configs_dir: PathBuf::from(DEFAULT_CONFIGS_DIR),
        }
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            socket_path: optional_env("ARMORCLAW_SOCKET")?
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            configs_dir: optional_env("ARMORCLAW_CONFIGS_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.configs_dir),
        })
    }
}

/// Settings for containers started through `start`.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub agent_type: String,
    /// Per-container scratch directories live here.
    pub container_dir: PathBuf,
    pub max_containers: usize,
    /// Egress proxy forwarded into every container.
    pub http_proxy: Option<String>,
    pub memory_limit_mb: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            agent_type: DEFAULT_AGENT_TYPE.to_string(),
            container_dir: PathBuf::from(DEFAULT_CONTAINER_DIR),
            max_containers: 100,
            http_proxy: None,
            memory_limit_mb: 2048,
        }
    }
}

impl ContainerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            image: optional_env("ARMORCLAW_IMAGE")?.unwrap_or(defaults.image),
            agent_type: optional_env("ARMORCLAW_AGENT_TYPE")?.unwrap_or(defaults.agent_type),
            container_dir: optional_env("ARMORCLAW_CONTAINER_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.container_dir),
            max_containers: parse_optional_env(
                "ARMORCLAW_MAX_CONTAINERS",
                defaults.max_containers,
            )?,
            http_proxy: optional_env("HTTP_PROXY")?,
            memory_limit_mb: parse_optional_env(
                "ARMORCLAW_MEMORY_LIMIT_MB",
                defaults.memory_limit_mb,
            )?,
        })
    }
}

/// Secret injector settings.
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// Directory holding one-shot secret endpoints.
    pub socket_dir: PathBuf,
    /// How long an endpoint waits for its container to connect.
    pub timeout: Duration,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SECRETS_DIR),
            timeout: Duration::from_secs(5),
        }
    }
}

impl SecretsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout_secs: u64 = parse_optional_env(
            "ARMORCLAW_SECRET_TIMEOUT_SECS",
            defaults.timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ARMORCLAW_SECRET_TIMEOUT_SECS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            socket_dir: optional_env("ARMORCLAW_SECRETS_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_dir),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Chat relay configuration. Absent unless a homeserver is set.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    pub homeserver_url: String,
    pub device_id: String,
}

impl MatrixConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(homeserver_url) = optional_env("ARMORCLAW_MATRIX_HOMESERVER")? else {
            return Ok(None);
        };
        if !homeserver_url.starts_with("http://") && !homeserver_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "ARMORCLAW_MATRIX_HOMESERVER".to_string(),
                message: "must be an http:// or https:// URL".to_string(),
            });
        }
        Ok(Some(Self {
            homeserver_url: homeserver_url.trim_end_matches('/').to_string(),
            device_id: optional_env("ARMORCLAW_MATRIX_DEVICE_ID")?
                .unwrap_or_else(|| "armorclaw-bridge".to_string()),
        }))
    }
}

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
