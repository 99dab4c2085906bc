//! Host-side secret injector.
//!
//! Each call to [`SecretInjector::inject_secrets`] binds a fresh Unix socket
//! inside `<socket_dir>/<container>/`, serves exactly one connection with one
//! secret envelope, then closes the listener and unlinks the socket. If nobody
//! connects within the configured timeout the endpoint is torn down and the
//! injection fails with [`InjectError::InjectionTimeout`].
//!
//! The per-container directory is what gets bind-mounted into the container.
//! The first delivery uses the well-known `secret.sock` the bootstrap is told
//! about; every later delivery to the same container binds a new
//! `update.<id>.sock` next to it, so no endpoint path is ever bound twice.
//! The directory is removed by [`SecretInjector::release`] when the container
//! goes away.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::config::SecretsConfig;
use crate::error::{ChannelError, InjectError};
use crate::secrets::{Credential, channel};

/// File name of the first endpoint inside the per-container directory.
pub const ENDPOINT_FILE: &str = "secret.sock";
/// Prefix of re-delivery endpoints: `update.<id>.sock`.
pub const UPDATE_ENDPOINT_PREFIX: &str = "update.";

const SOCKET_MODE: u32 = 0o660;
const DIRECTORY_MODE: u32 = 0o750;

struct Session {
    id: Uuid,
    path: PathBuf,
    abort: AbortHandle,
}

/// Creates and serves one-shot secret endpoints.
pub struct SecretInjector {
    socket_dir: PathBuf,
    timeout: Duration,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    /// Containers whose well-known endpoint has already been bound.
    served: Mutex<HashSet<String>>,
}

/// A pending delivery. The endpoint path is known immediately; the outcome
/// resolves once the container has connected or the timeout elapsed.
#[derive(Debug)]
pub struct Injection {
    container: String,
    endpoint: PathBuf,
    outcome: JoinHandle<Result<(), InjectError>>,
}

impl Injection {
    /// Filesystem path of the endpoint, to be mounted into the container.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Wait for the delivery to complete.
    pub async fn delivered(self) -> Result<(), InjectError> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(InjectError::Aborted {
                container: self.container,
            }),
        }
    }

    /// Abort the pending delivery. The endpoint is removed.
    pub fn cancel(&self) {
        self.outcome.abort();
    }
}

/// Removes the endpoint file on every exit path, including task abort.
struct EndpointGuard {
    path: PathBuf,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(endpoint = %self.path.display(), "Removed secret endpoint"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(endpoint = %self.path.display(), error = %e, "Failed to remove secret endpoint")
            }
        }
    }
}

impl SecretInjector {
    pub fn new(config: &SecretsConfig) -> Self {
        Self {
            socket_dir: config.socket_dir.clone(),
            timeout: config.timeout,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            served: Mutex::new(HashSet::new()),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Prepare a one-shot endpoint for `container` and start serving it.
    ///
    /// Returns as soon as the socket is bound so the caller can pass its path
    /// into the container's launch configuration.
    pub async fn inject_secrets(
        &self,
        container: &str,
        credential: Credential,
    ) -> Result<Injection, InjectError> {
        credential.validate()?;
        validate_container_name(container, &self.socket_dir)?;

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(container) {
            return Err(InjectError::EndpointExists {
                container: container.to_string(),
            });
        }

        ensure_directory(&self.socket_dir)?;
        let dir = self.endpoint_dir(container);
        ensure_directory(&dir)?;

        let id = Uuid::new_v4();
        let mut served = self.served.lock().await;
        let first = !served.contains(container);
        let path = if first {
            dir.join(ENDPOINT_FILE)
        } else {
            dir.join(update_endpoint_file(id))
        };
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path).map_err(|source| InjectError::Endpoint {
            path: path.clone(),
            source,
        })?;
        let guard = EndpointGuard { path: path.clone() };
        set_mode(&path, SOCKET_MODE)?;
        if first {
            served.insert(container.to_string());
        }
        drop(served);

        let outcome = tokio::spawn(serve_once(
            listener,
            guard,
            credential,
            self.timeout,
            container.to_string(),
            id,
            Arc::clone(&self.sessions),
        ));

        sessions.insert(
            container.to_string(),
            Session {
                id,
                path: path.clone(),
                abort: outcome.abort_handle(),
            },
        );

        tracing::info!(
            container = %container,
            endpoint = %path.display(),
            "Secret endpoint ready"
        );

        Ok(Injection {
            container: container.to_string(),
            endpoint: path,
            outcome,
        })
    }

    /// Directory holding the endpoint for `container`.
    pub fn endpoint_dir(&self, container: &str) -> PathBuf {
        self.socket_dir.join(container)
    }

    /// Abort any pending delivery for `container` and remove its directory.
    pub async fn release(&self, container: &str) {
        if let Some(session) = self.sessions.lock().await.remove(container) {
            session.abort.abort();
        }
        self.served.lock().await.remove(container);
        if validate_container_name(container, &self.socket_dir).is_err() {
            return;
        }
        match std::fs::remove_dir_all(self.endpoint_dir(container)) {
            Ok(()) => tracing::debug!(container = %container, "Released secret endpoint directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(container = %container, error = %e, "Failed to remove secret endpoint directory")
            }
        }
    }

    /// True while an endpoint for `container` is waiting for its connection.
    pub async fn is_pending(&self, container: &str) -> bool {
        self.sessions.lock().await.contains_key(container)
    }

    pub async fn pending_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Abort every pending session and remove its endpoint.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Session)> = self.sessions.lock().await.drain().collect();
        for (container, session) in drained {
            session.abort.abort();
            if let Err(e) = std::fs::remove_file(&session.path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(container = %container, error = %e, "Failed to remove secret endpoint on shutdown");
            }
            tracing::info!(container = %container, "Aborted pending secret session");
        }
        self.served.lock().await.clear();
    }
}

async fn serve_once(
    listener: UnixListener,
    guard: EndpointGuard,
    credential: Credential,
    timeout: Duration,
    container: String,
    session_id: Uuid,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
) -> Result<(), InjectError> {
    let result = match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(Ok((mut stream, _))) => {
            // Close the rendezvous before writing so no second peer can queue up.
            drop(listener);
            drop(guard);
            channel::send_envelope(&mut stream, &credential)
                .await
                .map_err(InjectError::from)
        }
        Ok(Err(e)) => {
            drop(listener);
            drop(guard);
            Err(InjectError::Delivery(ChannelError::Io(e)))
        }
        Err(_) => {
            drop(listener);
            drop(guard);
            Err(InjectError::InjectionTimeout {
                container: container.clone(),
                after: timeout,
            })
        }
    };
    drop(credential);

    {
        let mut sessions = sessions.lock().await;
        if sessions.get(&container).is_some_and(|s| s.id == session_id) {
            sessions.remove(&container);
        }
    }

    match &result {
        Ok(()) => tracing::info!(container = %container, "Delivered credential over secret endpoint"),
        Err(e) => tracing::warn!(container = %container, error = %e, "Secret delivery failed"),
    }

    result
}

fn update_endpoint_file(id: Uuid) -> String {
    format!("{UPDATE_ENDPOINT_PREFIX}{}.sock", id.simple())
}

fn validate_container_name(container: &str, dir: &Path) -> Result<(), InjectError> {
    let valid = !container.is_empty()
        && container.len() <= 64
        && !container.starts_with('.')
        && container
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(InjectError::Endpoint {
            path: dir.join(container),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "container name must be 1-64 characters of [A-Za-z0-9._-]",
            ),
        })
    }
}

fn ensure_directory(path: &Path) -> Result<(), InjectError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(InjectError::Endpoint {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|source| InjectError::Endpoint {
                path: path.to_path_buf(),
                source,
            })?;
            set_mode(path, DIRECTORY_MODE)
        }
        Err(source) => Err(InjectError::Endpoint {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove a leftover socket from a crashed run. Anything else at the path is an error.
fn remove_stale_socket(path: &Path) -> Result<(), InjectError> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path).map_err(|source| InjectError::Endpoint {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::debug!(endpoint = %path.display(), "Removed stale secret endpoint");
            Ok(())
        }
        Ok(_) => Err(InjectError::Endpoint {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "path exists but is not a socket",
            ),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(InjectError::Endpoint {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), InjectError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        InjectError::Endpoint {
            path: path.to_path_buf(),
            source,
        }
    })
}
