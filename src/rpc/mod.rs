//! JSON-RPC 2.0 control plane.

pub mod handlers;
pub mod methods;
pub mod protocol;
pub mod server;

pub use handlers::BridgeState;
pub use methods::MethodCall;
pub use protocol::{ErrorCode, JSONRPC_VERSION, Request, Response, RpcError};
pub use server::BridgeServer;
