//! Container lifecycle for agent containers.
//!
//! Starting a container is strictly ordered: the secret endpoint is bound
//! first, then the container is launched with that endpoint mounted, then the
//! manager waits for the one-shot delivery. Any failure after the endpoint
//! exists rolls back everything created so far.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::config::ContainerConfig;
use crate::error::OrchestratorError;
use crate::keystore::Keystore;
use crate::orchestrator::registry::{ContainerRecord, ContainerRegistry, ContainerState};
use crate::orchestrator::runtime::{ContainerRuntime, LaunchSpec};
use crate::secrets::{ENDPOINT_FILE, SecretInjector};

/// Where the host control socket appears inside a container.
pub const CONTAINER_CONTROL_SOCKET: &str = "/run/armorclaw/bridge.sock";
/// Where the container's secret endpoint directory is mounted.
pub const CONTAINER_SECRETS_DIR: &str = "/run/armorclaw/secrets";

/// Optional overrides for a single `start`.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub key_id: String,
    pub agent_type: Option<String>,
    pub image: Option<String>,
}

pub struct ContainerManager {
    config: ContainerConfig,
    control_socket: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    injector: Arc<SecretInjector>,
    keystore: Arc<dyn Keystore>,
    registry: ContainerRegistry,
}

impl ContainerManager {
    pub fn new(
        config: ContainerConfig,
        control_socket: PathBuf,
        runtime: Arc<dyn ContainerRuntime>,
        injector: Arc<SecretInjector>,
        keystore: Arc<dyn Keystore>,
    ) -> Self {
        let registry = ContainerRegistry::new(config.max_containers);
        Self {
            config,
            control_socket,
            runtime,
            injector,
            keystore,
            registry,
        }
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn injector(&self) -> &SecretInjector {
        &self.injector
    }

    /// Inject the key's credential, launch the container, and wait for delivery.
    pub async fn start(&self, request: StartRequest) -> Result<ContainerRecord, OrchestratorError> {
        if self.registry.is_full().await {
            return Err(OrchestratorError::LimitReached {
                max: self.registry.capacity(),
            });
        }

        let key = self.keystore.retrieve(&request.key_id).await?;
        let name = container_name(&request.key_id, Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let scratch = self.config.container_dir.join(&name);
        std::fs::create_dir_all(&scratch)?;

        match self.start_inner(&name, &request, key.to_credential()).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.injector.release(&name).await;
                remove_dir_logged(&scratch);
                tracing::warn!(container = %name, key_id = %request.key_id, error = %e, "Container start rolled back");
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        name: &str,
        request: &StartRequest,
        credential: crate::secrets::Credential,
    ) -> Result<ContainerRecord, OrchestratorError> {
        let injection = self.injector.inject_secrets(name, credential).await?;

        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.image.clone());
        let agent_type = request
            .agent_type
            .clone()
            .unwrap_or_else(|| self.config.agent_type.clone());
        let secret_dir = self.injector.endpoint_dir(name);
        let spec = self.launch_spec(name, &request.key_id, &image, &secret_dir);

        let container_id = match self.runtime.launch(&spec).await {
            Ok(id) => id,
            Err(e) => {
                injection.cancel();
                return Err(e);
            }
        };

        if let Err(e) = injection.delivered().await {
            if let Err(remove_err) = self.runtime.remove(&container_id).await {
                tracing::warn!(container = %name, error = %remove_err, "Failed to remove container after injection failure");
            }
            return Err(e.into());
        }

        let record = ContainerRecord {
            container_id: container_id.clone(),
            name: name.to_string(),
            image,
            agent_type,
            key_id: request.key_id.clone(),
            state: ContainerState::Running,
            endpoint: CONTAINER_CONTROL_SOCKET.to_string(),
            secret_dir,
            created_at: Utc::now(),
        };

        if let Err(e) = self.registry.insert(record.clone()).await {
            if let Err(remove_err) = self.runtime.remove(&container_id).await {
                tracing::warn!(container = %name, error = %remove_err, "Failed to remove container over capacity");
            }
            return Err(e);
        }

        tracing::info!(
            container = %name,
            container_id = %container_id,
            key_id = %request.key_id,
            "Agent container running"
        );
        Ok(record)
    }

    fn launch_spec(&self, name: &str, key_id: &str, image: &str, secret_dir: &Path) -> LaunchSpec {
        let mut env = vec![
            format!("ARMORCLAW_KEY_ID={key_id}"),
            format!("ARMORCLAW_ENDPOINT={CONTAINER_CONTROL_SOCKET}"),
            format!("ARMORCLAW_BRIDGE_SOCKET={CONTAINER_CONTROL_SOCKET}"),
            format!("ARMORCLAW_SECRET_SOCKET={CONTAINER_SECRETS_DIR}/{ENDPOINT_FILE}"),
        ];
        if let Some(ref proxy) = self.config.http_proxy {
            env.push(format!("HTTP_PROXY={proxy}"));
        }

        let binds = vec![
            format!("{}:{CONTAINER_SECRETS_DIR}:ro", secret_dir.display()),
            format!(
                "{}:{CONTAINER_CONTROL_SOCKET}",
                self.control_socket.display()
            ),
        ];

        LaunchSpec {
            name: name.to_string(),
            image: image.to_string(),
            env,
            binds,
            memory_limit_mb: self.config.memory_limit_mb,
        }
    }

    /// Force-remove a container and forget it.
    pub async fn stop(&self, container_id: &str) -> Result<ContainerRecord, OrchestratorError> {
        let mut record = self.registry.remove(container_id).await.ok_or_else(|| {
            OrchestratorError::ContainerNotFound {
                container_id: container_id.to_string(),
            }
        })?;

        if let Err(e) = self.runtime.remove(container_id).await {
            tracing::warn!(container = %record.name, error = %e, "Failed to remove container (may already be gone)");
        }
        self.injector.release(&record.name).await;
        remove_dir_logged(&self.config.container_dir.join(&record.name));

        record.state = ContainerState::Stopped;
        tracing::info!(container = %record.name, container_id = %container_id, "Stopped agent container");
        Ok(record)
    }

    /// Deliver a (possibly different) key to a running container.
    pub async fn send_secret(
        &self,
        container_id: &str,
        key_id: &str,
    ) -> Result<ContainerRecord, OrchestratorError> {
        let record = self.registry.get(container_id).await.ok_or_else(|| {
            OrchestratorError::ContainerNotFound {
                container_id: container_id.to_string(),
            }
        })?;
        let key = self.keystore.retrieve(key_id).await?;

        let injection = self
            .injector
            .inject_secrets(&record.name, key.to_credential())
            .await?;
        injection.delivered().await?;

        tracing::info!(container = %record.name, key_id = %key_id, "Re-delivered credential to running container");
        Ok(record)
    }

    /// Remove every container the bridge started. Used on shutdown.
    pub async fn stop_all(&self) {
        for record in self.registry.drain().await {
            if let Err(e) = self.runtime.remove(&record.container_id).await {
                tracing::warn!(container = %record.name, error = %e, "Failed to remove container on shutdown");
            }
            self.injector.release(&record.name).await;
            remove_dir_logged(&self.config.container_dir.join(&record.name));
        }
    }
}

/// `armorclaw-<key>-<nanos>`, restricted to characters valid in both Docker
/// names and endpoint paths.
pub fn container_name(key_id: &str, nanos: i64) -> String {
    let key: String = key_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(32)
        .collect();
    let key = key.trim_start_matches('.');
    format!("armorclaw-{key}-{nanos}")
}

fn remove_dir_logged(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove container directory"),
    }
}
