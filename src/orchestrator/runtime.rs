//! Container runtime collaborator.
//!
//! [`ContainerRuntime`] is the only seam between the bridge and whatever
//! actually runs containers. [`DockerRuntime`] drives a local Docker daemon
//! through bollard.

use async_trait::async_trait;
use bollard::Docker;

use crate::error::OrchestratorError;

/// Everything the runtime needs to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    /// `host:container[:opts]` bind mounts.
    pub binds: Vec<String>,
    pub memory_limit_mb: u64,
}

impl LaunchSpec {
    /// Value of an environment entry, if present.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Returns the runtime's container id.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, OrchestratorError>;

    /// Force-remove a container, stopping it first if needed.
    async fn remove(&self, container_id: &str) -> Result<(), OrchestratorError>;
}

/// Connect to the local Docker daemon and check that it answers.
pub async fn connect_docker() -> Result<Docker, OrchestratorError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| OrchestratorError::Docker {
        reason: e.to_string(),
    })?;
    docker.ping().await.map_err(|e| OrchestratorError::Docker {
        reason: format!("daemon not reachable: {e}"),
    })?;
    Ok(docker)
}

/// Docker-backed runtime producing hardened, non-root containers.
pub struct DockerRuntime {
    docker: Docker,
    user: String,
}

impl DockerRuntime {
    pub async fn connect() -> Result<Self, OrchestratorError> {
        Ok(Self {
            docker: connect_docker().await?,
            user: "10001:10001".to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, OrchestratorError> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let memory = memory_limit_bytes(spec)?;
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            memory: Some(memory),
            network_mode: Some("bridge".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(
                [("/tmp".to_string(), "size=256M,noexec".to_string())]
                    .into_iter()
                    .collect(),
            ),
            auto_remove: Some(true),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(host_config),
            user: Some(self.user.clone()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| OrchestratorError::ContainerCreationFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&response.id, None)
            .await
        {
            if let Err(remove_err) = self.remove(&response.id).await {
                tracing::warn!(
                    container = %spec.name,
                    container_id = %response.id,
                    error = %remove_err,
                    "Failed to remove container that did not start"
                );
            }
            return Err(OrchestratorError::ContainerCreationFailed {
                name: spec.name.clone(),
                reason: format!("failed to start container: {e}"),
            });
        }

        tracing::info!(
            container = %spec.name,
            container_id = %response.id,
            image = %spec.image,
            "Created and started agent container"
        );

        Ok(response.id)
    }

    async fn remove(&self, container_id: &str) -> Result<(), OrchestratorError> {
        self.docker
            .remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| OrchestratorError::Docker {
                reason: format!("failed to remove container {container_id}: {e}"),
            })
    }
}

/// Docker's memory limit in bytes. Limits that do not fit an `i64` are rejected.
fn memory_limit_bytes(spec: &LaunchSpec) -> Result<i64, OrchestratorError> {
    spec.memory_limit_mb
        .checked_mul(1024 * 1024)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .ok_or_else(|| OrchestratorError::ContainerCreationFailed {
            name: spec.name.clone(),
            reason: format!("memory limit of {} MiB is out of range", spec.memory_limit_mb),
        })
}
