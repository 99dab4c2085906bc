//! SecretAcquire: socket first, then file, then pre-set environment.

use std::path::Path;
use std::time::Duration;

use crate::bootstrap::{BootstrapSettings, EnvSnapshot};
use crate::error::ChannelError;
use crate::secrets::channel::MAX_ENVELOPE_LEN;
use crate::secrets::{Credential, ProviderTable, receive_from};

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Channel,
    File,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel => write!(f, "secret socket"),
            Self::File => write!(f, "secrets file"),
        }
    }
}

/// Result of a successful SecretAcquire.
#[derive(Debug)]
pub enum Acquired {
    Credential {
        source: Source,
        credential: Credential,
    },
    /// No credential was delivered, but these provider variables were
    /// already set when the container started.
    Environment(Vec<&'static str>),
}

/// Try every source in priority order. `None` means nothing usable anywhere.
pub async fn acquire(settings: &BootstrapSettings, env: &EnvSnapshot) -> Option<Acquired> {
    match from_channel(&settings.secret_socket, settings.receive_timeout).await {
        Ok(credential) => {
            return Some(Acquired::Credential {
                source: Source::Channel,
                credential,
            });
        }
        Err(ChannelError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(
                socket = %settings.secret_socket.display(),
                "No secret socket present"
            );
        }
        Err(e) => {
            tracing::warn!(
                socket = %settings.secret_socket.display(),
                error = %e,
                "Secret socket delivery failed, trying secrets file"
            );
        }
    }

    match from_file(&settings.secrets_path).await {
        Ok(Some(credential)) => {
            return Some(Acquired::Credential {
                source: Source::File,
                credential,
            });
        }
        Ok(None) => {
            tracing::debug!(path = %settings.secrets_path.display(), "No secrets file");
        }
        Err(e) => {
            tracing::warn!(
                path = %settings.secrets_path.display(),
                error = %e,
                "Secrets file unusable, checking environment"
            );
        }
    }

    let present = present_provider_vars(&settings.providers, env);
    if present.is_empty() {
        None
    } else {
        tracing::warn!(
            variables = ?present,
            "Using provider variables from the container environment (testing only)"
        );
        Some(Acquired::Environment(present))
    }
}

/// Read one envelope from the secret endpoint.
pub async fn from_channel(path: &Path, timeout: Duration) -> Result<Credential, ChannelError> {
    receive_from(path, timeout).await
}

/// Read a bare credential JSON document. Anything that is not a regular file
/// counts as absent.
pub async fn from_file(path: &Path) -> Result<Option<Credential>, ChannelError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Ok(None);
    }
    let len = usize::try_from(meta.len()).unwrap_or(usize::MAX);
    if len > MAX_ENVELOPE_LEN {
        return Err(ChannelError::Oversized {
            len,
            max: MAX_ENVELOPE_LEN,
        });
    }

    let body = tokio::fs::read(path).await?;
    let credential: Credential =
        serde_json::from_slice(&body).map_err(|e| ChannelError::from_json(&e))?;
    credential.validate()?;
    Ok(Some(credential))
}

/// Provider variables with a non-empty value, in table order.
pub fn present_provider_vars(providers: &ProviderTable, env: &EnvSnapshot) -> Vec<&'static str> {
    providers
        .env_vars()
        .filter(|var| env.get(*var).is_some_and(|value| !value.is_empty()))
        .collect()
}
