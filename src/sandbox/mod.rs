//! Guest code execution for the `exec_code` API.
//!
//! All guest languages run as subprocesses; nothing is interpreted inside
//! the runner's own process. Python goes through the bundled harness
//! (restricted builtins, whitelist importer); Bash, JavaScript, and Ruby
//! run the file directly with a context-injected environment. Every
//! invocation builds a fresh environment copy, so guest mutations can
//! never leak to the parent process or to later invocations.

pub mod bash;
pub mod python;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for guest execution.
pub type GuestResult<T> = Result<T, GuestError>;

/// Errors raised by guest code execution.
///
/// Guest failures are recorded as assertion failures; they halt the run
/// only when a device's keep-running policy says so.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    /// The guest source file does not exist in the workspace.
    #[error("guest file not found: {0}")]
    FileNotFound(String),

    /// The language runtime could not be started.
    #[error("failed to launch {lang} runtime '{program}': {source}")]
    Launch {
        lang: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The guest ran past its deadline and was killed.
    #[error("guest code timed out after {0:?}")]
    Timeout(Duration),

    /// The guest exited non-zero without a structured error frame.
    #[error("guest code failed (exit {code}): {detail}")]
    NonZeroExit { code: i32, detail: String },

    /// A structured Python error reported by the harness
    /// (e.g. a sandbox import violation).
    #[error("{kind}: {message}")]
    Python { kind: String, message: String },

    /// The requested language is not in the supported set.
    #[error("unsupported guest language '{0}' (supported: python, bash, javascript, ruby)")]
    UnsupportedLang(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a guest is allowed to see from the run.
#[derive(Debug, Clone, Default)]
pub struct GuestContext {
    pub last_output: String,
    pub variables: HashMap<String, String>,
    /// Env-file sections as JSON (Python context) ...
    pub config: serde_json::Value,
    /// ... and as `(section, key, value)` triples (Bash env injection).
    pub config_entries: Vec<(String, String, String)>,
    pub workspace: PathBuf,
    pub current_device: String,
    pub device_names: Vec<String>,
    /// Flag/value pairs of the invoking op (plugin APIs).
    pub params: HashMap<String, String>,
    /// `setenv` entries, injected verbatim into subprocess environments.
    pub env_overlay: Vec<(String, String)>,
}

/// Result of a successful guest run.
#[derive(Debug, Clone, Default)]
pub struct GuestOutcome {
    /// The captured result value (`__result__`, `func(*args)`, or stdout).
    pub value: Option<String>,
    /// `set_variable` writes to replay into the run's variable store.
    pub variable_writes: Vec<(String, String)>,
}

/// Runs a prepared command with a deadline. The child is killed when the
/// deadline passes (the process handle is armed with `kill_on_drop`).
pub(crate) async fn run_with_timeout(
    command: &mut tokio::process::Command,
    timeout: Duration,
    lang: &str,
    program: &str,
) -> GuestResult<std::process::Output> {
    command.kill_on_drop(true);
    let child = command.spawn().map_err(|e| GuestError::Launch {
        lang: lang.to_string(),
        program: program.to_string(),
        source: e,
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(GuestError::Timeout(timeout)),
    }
}

/// Probes whether a language runtime exists on this host. Used by tests
/// to skip when an interpreter is absent.
pub fn runtime_available(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}
