//! ExecValidate and Exec.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::bootstrap::EnvSnapshot;
use crate::error::BootstrapError;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A validated command ready to replace the bootstrap process.
pub struct Handoff {
    pub program: PathBuf,
    /// Full argv, including argv[0] as given by the caller.
    pub args: Vec<String>,
    pub env: EnvSnapshot,
}

impl Handoff {
    /// Replace the current process image. Only returns on failure.
    pub fn exec(self) -> BootstrapError {
        let mut command = Command::new(&self.program);
        if let Some((argv0, rest)) = self.args.split_first() {
            command.arg0(argv0).args(rest);
        }
        command.env_clear().envs(&self.env);

        let source = command.exec();
        BootstrapError::ExecFailed {
            command: self.program.display().to_string(),
            source,
        }
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolve `command` to an executable file.
///
/// Names containing a slash are taken as paths; bare names are looked up on
/// the snapshot's `PATH`.
pub fn resolve(command: &str, env: &EnvSnapshot) -> Result<PathBuf, BootstrapError> {
    if command.is_empty() {
        return Err(not_found(command, "empty command"));
    }

    if command.contains('/') {
        let path = Path::new(command);
        check_executable(path).map_err(|reason| not_found(command, reason))?;
        return Ok(path.to_path_buf());
    }

    let search = env
        .get("PATH")
        .filter(|p| !p.is_empty())
        .map_or(FALLBACK_PATH, String::as_str);
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(command, Some(search), cwd)
        .map_err(|e| not_found(command, format!("{e}; searched PATH={search}")))
}

fn check_executable(path: &Path) -> Result<(), String> {
    let meta = std::fs::metadata(path).map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err("not executable".to_string());
    }
    Ok(())
}

fn not_found(command: &str, reason: impl Into<String>) -> BootstrapError {
    BootstrapError::CommandNotFound {
        command: command.to_string(),
        reason: reason.into(),
    }
}
