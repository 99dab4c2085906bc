//! ArmorClaw container entrypoint.
//!
//! Acquires the container's credential, validates the agent command and
//! replaces itself with it. Logs go to stderr so the agent's stdout stays
//! clean.

use tracing_subscriber::EnvFilter;

use armorclaw::bootstrap::{Bootstrap, BootstrapSettings, Outcome, env_snapshot};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("armorclaw=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let env = env_snapshot();
    let settings = BootstrapSettings::from_env(&env);
    let args: Vec<String> = std::env::args_os()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    let mut bootstrap = Bootstrap::new(settings, args, env);
    let code = match bootstrap.run().await {
        Ok(Outcome::Exit { message }) => {
            println!("{message}");
            0
        }
        Ok(Outcome::Exec(handoff)) => {
            tracing::info!(program = %handoff.program.display(), "Starting agent");
            let error = handoff.exec();
            eprintln!("[ArmorClaw] bootstrap aborted in Exec: {error}");
            error.exit_code()
        }
        Err(abort) => {
            eprintln!("[ArmorClaw] {abort}");
            if abort.exit_code() == 127 {
                eprintln!("[ArmorClaw] The agent is not installed or the image is incomplete.");
                eprintln!("[ArmorClaw] Override the command to run something else in this container.");
            } else {
                eprintln!("[ArmorClaw] Start containers through the bridge so a credential is injected,");
                eprintln!("[ArmorClaw] or pass a provider variable with -e for testing.");
            }
            abort.exit_code()
        }
    };
    std::process::exit(code);
}
