//! ArmorClaw: one-shot credential injection for hardened agent containers.
//!
//! The host side ([`rpc::server`], [`secrets::injector`], [`orchestrator`])
//! starts containers and pushes a single credential into each one through a
//! length-framed socket. The container side ([`bootstrap`]) receives that
//! credential, maps it onto the environment and execs the real agent, which
//! then talks back to the host through [`client`].

pub mod bootstrap;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod keystore;
pub mod orchestrator;
pub mod relay;
pub mod rpc;
pub mod secrets;

/// Version reported by `status` and the bootstrap `--version` flag.
pub const VERSION: &str = "1.0.0";
