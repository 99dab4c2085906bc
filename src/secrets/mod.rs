//! Credential injection over one-shot Unix sockets.
//!
//! ```text
//! ┌────────────── host ──────────────┐          ┌──────────── container ───────────┐
//! │                                  │          │                                  │
//! │  keystore ──► SecretInjector     │  bind    │                                  │
//! │               │ <dir>/<name>/    │ ───────► │  /run/armorclaw/secrets (ro)     │
//! │               │                  │          │          │                       │
//! │               ▼                  │ connect  │          ▼                       │
//! │        accept exactly once ◄─────┼──────────┼── bootstrap SecretAcquire        │
//! │        write [len:u32 BE][json]  │          │   read envelope, validate        │
//! │        close + unlink            │          │   apply env, exec agent          │
//! └──────────────────────────────────┘          └──────────────────────────────────┘
//! ```
//!
//! The token never touches a path that outlives the transfer: the socket is
//! unlinked as soon as the single connection is accepted, or when the
//! delivery times out.

pub mod channel;
mod credential;
pub mod injector;

pub use channel::{encode_envelope, read_envelope, receive_from, send_envelope};
pub use credential::{Credential, ProviderTable};
pub use injector::{ENDPOINT_FILE, Injection, SecretInjector, UPDATE_ENDPOINT_PREFIX};
