//! Control-plane server.
//!
//! One listener on a Unix socket, one task per connection. Each connection
//! carries newline-terminated JSON-RPC requests; a request without a trailing
//! newline is still accepted once it parses as a complete JSON value. Every
//! request gets exactly one response line.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

use crate::rpc::handlers::BridgeState;
use crate::rpc::methods::MethodCall;
use crate::rpc::protocol::{ErrorCode, JSONRPC_VERSION, Request, Response, RpcError};

const SOCKET_MODE: u32 = 0o660;
const READ_CHUNK: usize = 4096;
/// Large enough for a base64-encoded maximum-size `attach_config`.
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
const MAX_CONNECTIONS: usize = 64;

pub struct BridgeServer {
    listener: UnixListener,
    path: PathBuf,
    state: Arc<BridgeState>,
    connections: Arc<Semaphore>,
}

impl BridgeServer {
    /// Bind the control socket, replacing a stale socket from a previous run.
    pub fn bind(path: &Path, state: Arc<BridgeState>) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("failed to bind control socket {}: {e}", path.display()),
            )
        })?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        }

        tracing::info!(socket = %path.display(), "Control plane listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            state,
            connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept control connection");
                            continue;
                        }
                    };
                    let permit = match Arc::clone(&self.connections).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            tracing::debug!(error = %e, "Control connection ended with error");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(socket = %self.path.display(), error = %e, "Failed to remove control socket");
        }
        tracing::info!("Control plane stopped");
        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<BridgeState>) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        while let Some(frame) = next_frame(&mut buf) {
            let response = process(&state, &frame).await;
            write_response(&mut writer, &response).await?;
        }

        if buf.len() > MAX_REQUEST_BYTES {
            let response = Response::failure(
                Value::Null,
                RpcError::new(ErrorCode::InvalidRequest, "request too large"),
            );
            write_response(&mut writer, &response).await?;
            return Ok(());
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !buf.iter().all(u8::is_ascii_whitespace) {
                let response = process(&state, &buf).await;
                write_response(&mut writer, &response).await?;
            }
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Split off the next complete request: a newline-terminated line, or a
/// complete JSON value that arrived without its newline.
fn next_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).take(pos).collect();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(line);
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let end = {
            let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
            match values.next() {
                Some(Ok(_)) => Some(values.byte_offset()),
                _ => None,
            }
        };
        return end.map(|end| buf.drain(..end).collect());
    }
}

async fn process(state: &BridgeState, frame: &[u8]) -> Response {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(_) => {
            return Response::failure(
                Value::Null,
                RpcError::new(ErrorCode::ParseError, "parse error"),
            );
        }
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    let request: Request = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(_) => {
            return Response::failure(
                id,
                RpcError::new(ErrorCode::InvalidRequest, "invalid request"),
            );
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return Response::failure(
            request.id,
            RpcError::new(ErrorCode::InvalidRequest, "jsonrpc must be \"2.0\""),
        );
    }

    let call = match MethodCall::parse(&request.method, request.params) {
        Ok(call) => call,
        Err(e) => return Response::failure(request.id, e),
    };

    let method = call.name();
    let started = Instant::now();
    let outcome = state.dispatch(call).await;
    match &outcome {
        Ok(_) => tracing::debug!(
            method,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Handled control request"
        ),
        Err(e) => tracing::warn!(
            method,
            code = e.code,
            error = %e.message,
            "Control request failed"
        ),
    }
    Response::from_result(request.id, outcome)
}

async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            tracing::debug!(socket = %path.display(), "Removed stale control socket");
            Ok(())
        }
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
