//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the bridge (`serve`, the default)
//! - Sending a raw control-plane request (`call`)
//! - Printing bridge status (`status`)

mod call;
mod status;

pub use call::run_call_command;
pub use status::run_status_command;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_SOCKET_PATH;

#[derive(Parser, Debug)]
#[command(name = "armorclaw-bridge")]
#[command(about = "Host bridge for hardened ArmorClaw agent containers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Control socket path (overrides ARMORCLAW_SOCKET)
    #[arg(short, long, global = true, env = "ARMORCLAW_SOCKET")]
    pub socket: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bridge (default if no subcommand given)
    Serve,

    /// Send one JSON-RPC request to a running bridge and print the result
    Call {
        /// Method name, e.g. `status` or `matrix.send`
        method: String,

        /// Params as a JSON object
        params: Option<String>,

        /// Per-call timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show bridge status
    Status,
}

impl Cli {
    /// Control socket for client commands. Needs none of the bridge's own config.
    pub fn control_socket(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}
