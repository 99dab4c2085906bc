//! Container bootstrap.
//!
//! The container entrypoint runs this strictly linear state machine before
//! the agent takes over the process:
//!
//! ```text
//! ArgumentCheck → SecretAcquire → SecretApply → CredentialVerify
//!   → ProxyConfigure → SecurityCheck → ExecValidate → ReadinessCheck → Exec
//!
//! SecretAcquire, CredentialVerify, ExecValidate, Exec ──(failure)──► Abort
//! ```
//!
//! ProxyConfigure, SecurityCheck and ReadinessCheck are advisory: they log and
//! move on. Everything runs against an [`EnvSnapshot`] taken at startup; the
//! exec'd agent receives exactly that snapshot after all mutations.

pub mod acquire;
pub mod exec;
pub mod proxy;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BootstrapError;
use crate::secrets::ProviderTable;
use crate::secrets::channel::RECEIVE_TIMEOUT;

pub use acquire::{Acquired, Source};
pub use exec::Handoff;
pub use proxy::ProxyOutcome;

/// Environment the bootstrap works on and hands to the agent.
pub type EnvSnapshot = BTreeMap<String, String>;

pub const SECRET_SOCKET_VAR: &str = "ARMORCLAW_SECRET_SOCKET";
pub const SECRETS_PATH_VAR: &str = "ARMORCLAW_SECRETS_PATH";
pub const DEFAULT_SECRET_SOCKET: &str = "/run/secrets/socket";
pub const DEFAULT_SECRETS_PATH: &str = "/run/secrets";
pub const PROVIDER_MARKER: &str = "ARMORCLAW_PROVIDER";
pub const ALLOW_EXEC_MARKER: &str = "ARMORCLAW_ALLOW_EXEC";
pub const EXPECTED_UID: u32 = 10001;
pub const MIN_AVAILABLE_MEMORY_MB: u64 = 128;
pub const DEFAULT_COMMAND: &[&str] = &["python", "-c", "from openclaw import main; main()"];

const MEMINFO: &str = "/proc/meminfo";

const HELP: &str = "\
ArmorClaw v1.0.0 - hardened container runtime for AI agents

USAGE:
    docker run [OPTIONS] armorclaw/agent:v1 [COMMAND]...

    Without COMMAND the OpenClaw agent is started. Any COMMAND replaces it
    and runs with the same credentials and environment.

SECRETS:
    Production: delivered by the bridge over $ARMORCLAW_SECRET_SOCKET
    Fallback:   credential JSON at $ARMORCLAW_SECRETS_PATH
    Testing:    -e OPENAI_API_KEY=... (or another provider variable)

SUPPORTED PROVIDERS:
    openai      OPENAI_API_KEY
    anthropic   ANTHROPIC_API_KEY
    openrouter  OPENROUTER_API_KEY
    google      GOOGLE_API_KEY
    gemini      GEMINI_API_KEY
    xai         XAI_API_KEY
    slack       SLACK_BOT_TOKEN
    discord     DISCORD_BOT_TOKEN
    teams       MICROSOFT_API_KEY
    whatsapp    WHATSAPP_API_KEY

SECURITY:
    Runs as UID 10001 with a read-only root filesystem and no capabilities.
";

/// Capture the process environment, skipping entries that are not UTF-8.
pub fn env_snapshot() -> EnvSnapshot {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ArgumentCheck,
    SecretAcquire,
    SecretApply,
    CredentialVerify,
    ProxyConfigure,
    SecurityCheck,
    ExecValidate,
    ReadinessCheck,
    Exec,
    Abort,
}

impl State {
    /// Advisory states never move to [`State::Abort`].
    pub fn is_advisory(self) -> bool {
        matches!(
            self,
            Self::ProxyConfigure | Self::SecurityCheck | Self::ReadinessCheck
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ArgumentCheck => "ArgumentCheck",
            Self::SecretAcquire => "SecretAcquire",
            Self::SecretApply => "SecretApply",
            Self::CredentialVerify => "CredentialVerify",
            Self::ProxyConfigure => "ProxyConfigure",
            Self::SecurityCheck => "SecurityCheck",
            Self::ExecValidate => "ExecValidate",
            Self::ReadinessCheck => "ReadinessCheck",
            Self::Exec => "Exec",
            Self::Abort => "Abort",
        };
        f.write_str(name)
    }
}

/// Terminal failure: which state failed and why.
#[derive(Debug, thiserror::Error)]
#[error("bootstrap aborted in {state}: {error}")]
pub struct Abort {
    pub state: State,
    #[source]
    pub error: BootstrapError,
}

impl Abort {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Help or version was requested; print and exit 0.
    Exit { message: String },
    /// Every check passed; replace the process.
    Exec(Handoff),
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub secret_socket: PathBuf,
    pub secrets_path: PathBuf,
    pub receive_timeout: Duration,
    pub expected_uid: u32,
    pub meminfo_path: PathBuf,
    pub min_available_mb: u64,
    pub providers: ProviderTable,
}

impl BootstrapSettings {
    pub fn from_env(env: &EnvSnapshot) -> Self {
        let path_or = |var: &str, default: &str| {
            PathBuf::from(
                env.get(var)
                    .filter(|v| !v.is_empty())
                    .map_or(default, String::as_str),
            )
        };
        Self {
            secret_socket: path_or(SECRET_SOCKET_VAR, DEFAULT_SECRET_SOCKET),
            secrets_path: path_or(SECRETS_PATH_VAR, DEFAULT_SECRETS_PATH),
            receive_timeout: RECEIVE_TIMEOUT,
            expected_uid: EXPECTED_UID,
            meminfo_path: PathBuf::from(MEMINFO),
            min_available_mb: MIN_AVAILABLE_MEMORY_MB,
            providers: ProviderTable::standard(),
        }
    }
}

pub struct Bootstrap {
    settings: BootstrapSettings,
    args: Vec<String>,
    env: EnvSnapshot,
    uid: u32,
    history: Vec<State>,
}

impl Bootstrap {
    /// `args` excludes argv[0].
    pub fn new(settings: BootstrapSettings, args: Vec<String>, env: EnvSnapshot) -> Self {
        Self {
            settings,
            args,
            env,
            uid: nix::unistd::geteuid().as_raw(),
            history: Vec::new(),
        }
    }

    /// Override the effective uid seen by SecurityCheck.
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// States entered so far, in order.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    pub async fn run(&mut self) -> Result<Outcome, Abort> {
        self.enter(State::ArgumentCheck);
        if let Some(message) = argument_check(&self.args) {
            return Ok(Outcome::Exit { message });
        }

        self.enter(State::SecretAcquire);
        let Some(acquired) = acquire::acquire(&self.settings, &self.env).await else {
            return Err(self.abort(State::SecretAcquire, BootstrapError::NoCredentials));
        };

        self.enter(State::SecretApply);
        self.apply(acquired);

        self.enter(State::CredentialVerify);
        let present = acquire::present_provider_vars(&self.settings.providers, &self.env);
        if present.is_empty() {
            return Err(self.abort(State::CredentialVerify, BootstrapError::NoCredentials));
        }
        tracing::info!(variables = ?present, "Provider credentials present");

        self.enter(State::ProxyConfigure);
        match proxy::configure(&mut self.env) {
            ProxyOutcome::Enabled(shown) => tracing::info!(proxy = %shown, "Egress proxy configured"),
            ProxyOutcome::Rejected => {
                tracing::warn!("HTTP_PROXY is not an http(s) URL, continuing without a proxy")
            }
            ProxyOutcome::Absent => tracing::info!("No HTTP_PROXY configured"),
        }

        self.enter(State::SecurityCheck);
        if self.uid != self.settings.expected_uid {
            tracing::warn!(
                uid = self.uid,
                expected = self.settings.expected_uid,
                "Not running as the designated unprivileged user"
            );
        }

        self.enter(State::ExecValidate);
        let command: Vec<String> = if self.args.is_empty() {
            DEFAULT_COMMAND.iter().map(|s| (*s).to_string()).collect()
        } else {
            self.args.clone()
        };
        let program = match exec::resolve(&command[0], &self.env) {
            Ok(program) => program,
            Err(e) => return Err(self.abort(State::ExecValidate, e)),
        };
        tracing::info!(program = %program.display(), "Agent command validated");

        self.enter(State::ReadinessCheck);
        match available_memory_mb(&self.settings.meminfo_path) {
            Some(mb) if mb < self.settings.min_available_mb => {
                tracing::warn!(available_mb = mb, "Low memory available");
            }
            Some(_) => {}
            None => tracing::debug!("Memory information unavailable"),
        }

        self.enter(State::Exec);
        self.env.insert(ALLOW_EXEC_MARKER.to_string(), "1".to_string());
        Ok(Outcome::Exec(Handoff {
            program,
            args: command,
            env: self.env.clone(),
        }))
    }

    fn enter(&mut self, state: State) {
        tracing::info!(state = %state, "Bootstrap state");
        self.history.push(state);
    }

    fn abort(&mut self, state: State, error: BootstrapError) -> Abort {
        tracing::error!(state = %state, error = %error, "Bootstrap failed");
        self.history.push(State::Abort);
        Abort { state, error }
    }

    fn apply(&mut self, acquired: Acquired) {
        match acquired {
            Acquired::Credential { source, credential } => {
                let provider = credential.provider_key();
                match self.settings.providers.env_var(&provider) {
                    Some(var) => {
                        self.env.insert(var.to_string(), credential.token);
                        self.env.insert(PROVIDER_MARKER.to_string(), provider.clone());
                        tracing::info!(
                            provider = %provider,
                            variable = var,
                            source = %source,
                            "Credential applied"
                        );
                    }
                    None => tracing::warn!(
                        provider = %provider,
                        source = %source,
                        "Unrecognized provider, credential not applied"
                    ),
                }
            }
            Acquired::Environment(vars) => {
                tracing::info!(variables = ?vars, "No credential delivered, keeping environment");
            }
        }
    }
}

/// Help or version text if any argument asks for it. Help wins over version.
fn argument_check(args: &[String]) -> Option<String> {
    let has = |flags: [&str; 2]| args.iter().any(|arg| flags.contains(&arg.as_str()));
    if has(["--help", "-h"]) {
        Some(HELP.to_string())
    } else if has(["--version", "-v"]) {
        Some(format!(
            "ArmorClaw v{}\nHardened container runtime for AI agents",
            crate::VERSION
        ))
    } else {
        None
    }
}

/// `MemAvailable` in MiB, falling back to `MemTotal` on old kernels.
fn available_memory_mb(path: &Path) -> Option<u64> {
    let meminfo = std::fs::read_to_string(path).ok()?;
    let field = |name: &str| {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    field("MemAvailable")
        .or_else(|| field("MemTotal"))
        .map(|kb| kb / 1024)
}
