//! Python guest runner.
//!
//! Guest Python runs in a separate interpreter through the bundled
//! harness, which rebuilds the restricted execution environment: safe
//! builtins minus the blocklist, a whitelist importer (`re`, `json`,
//! `datetime`, `math`), and result capture from `__result__` or a named
//! function. The harness reports results, errors, and `set_variable`
//! writes as marker-framed JSON lines on stdout.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value as Json, json};

use super::{GuestContext, GuestError, GuestOutcome, GuestResult, run_with_timeout};
use crate::bundled;

const RESULT_MARKER: &str = "__FOS_RESULT__";
const SETVAR_MARKER: &str = "__FOS_SETVAR__";
const ERROR_MARKER: &str = "__FOS_ERROR__";
const LOG_MARKER: &str = "__FOS_LOG__";

/// Runs a guest Python file, optionally calling `func(*args)` for the
/// result instead of reading `__result__`.
pub async fn run_python(
    file: &Path,
    func: Option<&str>,
    args: Option<&str>,
    context: &GuestContext,
    timeout: Duration,
) -> GuestResult<GuestOutcome> {
    if !file.exists() {
        return Err(GuestError::FileNotFound(file.display().to_string()));
    }

    let harness = bundled::python_harness_path()
        .map_err(|e| GuestError::Io(std::io::Error::other(e.to_string())))?;

    // The context crosses the process boundary as a JSON file.
    let mut context_file = tempfile::NamedTempFile::new()?;
    context_file.write_all(context_json(context).to_string().as_bytes())?;
    context_file.flush()?;

    let mut command = tokio::process::Command::new("python3");
    command
        .arg(&harness)
        .arg(context_file.path())
        .arg(file)
        .arg(func.unwrap_or(""))
        .arg(args.unwrap_or(""))
        .current_dir(&context.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = run_with_timeout(&mut command, timeout, "python", "python3").await?;
    parse_harness_output(&output)
}

fn context_json(context: &GuestContext) -> Json {
    json!({
        "last_output": context.last_output,
        "variables": context.variables,
        "config": context.config,
        "workspace": context.workspace.display().to_string(),
        "current_device": context.current_device,
        "device_names": context.device_names,
        "params": context.params,
    })
}

fn parse_harness_output(output: &std::process::Output) -> GuestResult<GuestOutcome> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut outcome = GuestOutcome::default();
    let mut error: Option<GuestError> = None;

    for line in stdout.lines() {
        if let Some(frame) = line.strip_prefix(RESULT_MARKER) {
            let value = serde_json::from_str::<Json>(frame)
                .ok()
                .and_then(|v| v.get("value").cloned());
            outcome.value = value.and_then(json_scalar_to_string);
        } else if let Some(frame) = line.strip_prefix(SETVAR_MARKER) {
            if let Ok(v) = serde_json::from_str::<Json>(frame)
                && let (Some(name), Some(value)) = (
                    v.get("name").and_then(Json::as_str),
                    v.get("value").and_then(Json::as_str),
                )
            {
                outcome
                    .variable_writes
                    .push((name.to_string(), value.to_string()));
            }
        } else if let Some(frame) = line.strip_prefix(ERROR_MARKER) {
            let v: Json = serde_json::from_str(frame).unwrap_or(Json::Null);
            error = Some(GuestError::Python {
                kind: v
                    .get("type")
                    .and_then(Json::as_str)
                    .unwrap_or("Error")
                    .to_string(),
                message: v
                    .get("message")
                    .and_then(Json::as_str)
                    .unwrap_or("guest failure")
                    .to_string(),
            });
        } else if let Some(frame) = line.strip_prefix(LOG_MARKER) {
            if let Ok(v) = serde_json::from_str::<Json>(frame)
                && let Some(message) = v.get("message").and_then(Json::as_str)
            {
                tracing::info!(target: "fosrun::guest", "{message}");
            }
        }
    }

    if let Some(err) = error {
        return Err(err);
    }

    if !output.status.success() && outcome.value.is_none() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GuestError::NonZeroExit {
            code: output.status.code().unwrap_or(-1),
            detail: stderr.trim().to_string(),
        });
    }

    Ok(outcome)
}

fn json_scalar_to_string(value: Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::String(s) => Some(s),
        Json::Bool(b) => Some(b.to_string()),
        Json::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
