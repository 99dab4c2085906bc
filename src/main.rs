//! ArmorClaw bridge - main entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use armorclaw::{
    cli::{Cli, Command, run_call_command, run_status_command},
    config::BridgeConfig,
    keystore::{InMemoryKeystore, Keystore},
    orchestrator::{ContainerManager, ContainerRuntime, DockerRuntime},
    relay::{ChatRelay, MatrixRelay},
    rpc::{BridgeServer, BridgeState},
    secrets::{ProviderTable, SecretInjector},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle client commands first (they don't need the bridge config)
    match &cli.command {
        Some(Command::Call {
            method,
            params,
            timeout,
        }) => {
            init_cli_logging();
            return run_call_command(&cli.control_socket(), method, params.as_deref(), *timeout)
                .await;
        }
        Some(Command::Status) => {
            init_cli_logging();
            return run_status_command(&cli.control_socket()).await;
        }
        None | Some(Command::Serve) => {}
    }

    let mut config = BridgeConfig::from_env()?;
    if let Some(socket) = cli.socket.clone() {
        config.server.socket_path = socket;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("armorclaw=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting ArmorClaw bridge v{}...", armorclaw::VERSION);

    let keystore: Arc<dyn Keystore> = Arc::new(InMemoryKeystore::new(ProviderTable::standard()));
    let injector = Arc::new(SecretInjector::new(&config.secrets));
    tracing::info!(
        dir = %config.secrets.socket_dir.display(),
        timeout_secs = config.secrets.timeout.as_secs(),
        "Secret injector ready"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect()
            .await
            .context("container runtime unavailable")?,
    );
    tracing::info!("Docker connected");

    let containers = ContainerManager::new(
        config.containers.clone(),
        config.server.socket_path.clone(),
        runtime,
        Arc::clone(&injector),
        Arc::clone(&keystore),
    );

    let relay: Option<Arc<dyn ChatRelay>> = match &config.matrix {
        Some(matrix) => {
            tracing::info!(homeserver = %matrix.homeserver_url, "Matrix relay enabled");
            Some(Arc::new(MatrixRelay::new(matrix)))
        }
        None => {
            tracing::info!("Matrix relay not configured");
            None
        }
    };

    let state = Arc::new(BridgeState {
        socket_path: config.server.socket_path.clone(),
        configs_dir: config.server.configs_dir.clone(),
        keystore,
        containers,
        relay,
    });

    let server = BridgeServer::bind(&config.server.socket_path, Arc::clone(&state))
        .context("failed to start control plane")?;
    server.run(shutdown_signal()).await?;

    injector.shutdown().await;
    state.containers.stop_all().await;
    tracing::info!("ArmorClaw bridge stopped");
    Ok(())
}

fn init_cli_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
    tracing::info!("Shutdown requested");
}
