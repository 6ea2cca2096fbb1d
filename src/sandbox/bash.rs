//! Bash (and generic subprocess) guest runner.
//!
//! The guest runs with a *copy* of the parent environment extended with
//! the run context. The child's environment is built from scratch with
//! `env_clear`, so `export` statements inside one guest are invisible to
//! the parent process and to every later invocation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use super::{GuestContext, GuestError, GuestOutcome, GuestResult, run_with_timeout};

/// Runs `bash <file>` with the injected environment; stdout is the result.
pub async fn run_bash(
    file: &Path,
    context: &GuestContext,
    timeout: Duration,
) -> GuestResult<GuestOutcome> {
    run_program("bash", "bash", file, context, timeout).await
}

/// Generic runner used for the non-Python guest languages.
pub async fn run_program(
    lang: &str,
    program: &str,
    file: &Path,
    context: &GuestContext,
    timeout: Duration,
) -> GuestResult<GuestOutcome> {
    if !file.exists() {
        return Err(GuestError::FileNotFound(file.display().to_string()));
    }

    let mut command = tokio::process::Command::new(program);
    command
        .arg(file)
        .current_dir(&context.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    apply_environment(&mut command, context);

    let output = run_with_timeout(&mut command, timeout, lang, program).await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GuestError::NonZeroExit {
            code: output.status.code().unwrap_or(-1),
            detail: stderr.trim().to_string(),
        });
    }

    Ok(GuestOutcome {
        value: Some(stdout.trim_end_matches('\n').to_string()),
        variable_writes: Vec::new(),
    })
}

/// Builds the child environment: fresh copy of the parent env, then the
/// run context on top.
fn apply_environment(command: &mut tokio::process::Command, context: &GuestContext) {
    command.env_clear();
    for (key, value) in std::env::vars() {
        command.env(key, value);
    }

    for (name, value) in &context.variables {
        command.env(name.to_uppercase(), value);
    }
    for (section, key, value) in &context.config_entries {
        command.env(
            format!("{}__{}", section.to_uppercase(), key.to_uppercase()),
            value,
        );
    }

    for (key, value) in &context.env_overlay {
        command.env(key, value);
    }

    command.env("LAST_OUTPUT", &context.last_output);
    command.env("WORKSPACE", context.workspace.display().to_string());
    command.env("CURRENT_DEVICE_NAME", &context.current_device);
    command.env("DEVICE_NAMES", context.device_names.join(","));

    for (flag, value) in &context.params {
        let name = flag.trim_start_matches('-').to_uppercase();
        command.env(format!("FOS_PARAM_{name}"), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime_available;
    use std::collections::HashMap;

    fn context_in(dir: &Path) -> GuestContext {
        GuestContext {
            workspace: dir.to_path_buf(),
            current_device: "FGT1".to_string(),
            device_names: vec!["FGT1".to_string(), "PC1".to_string()],
            ..Default::default()
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_stdout_is_the_result() {
        if !runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "s.sh", "echo hello from guest\n");

        let outcome = run_bash(&script, &context_in(dir.path()), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.value.as_deref(), Some("hello from guest"));
    }

    #[tokio::test]
    async fn test_env_injection() {
        if !runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "s.sh", "echo $MGMT_IP:$CURRENT_DEVICE_NAME\n");

        let mut context = context_in(dir.path());
        context.variables =
            HashMap::from([("mgmt_ip".to_string(), "10.0.0.1".to_string())]);

        let outcome = run_bash(&script, &context, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.value.as_deref(), Some("10.0.0.1:FGT1"));
    }

    #[tokio::test]
    async fn test_exported_variables_do_not_leak_between_calls() {
        if !runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let s1 = write_script(dir.path(), "s1.sh", "export FOS_LEAK_PROBE=modified\n");
        let s2 = write_script(dir.path(), "s2.sh", "echo \"$FOS_LEAK_PROBE\"\n");

        let context = context_in(dir.path());

        run_bash(&s1, &context, Duration::from_secs(10)).await.unwrap();
        let outcome = run_bash(&s2, &context, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.value.as_deref(), Some(""));
        // The parent environment never saw the export.
        assert!(std::env::var("FOS_LEAK_PROBE").is_err());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        if !runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "echo doom >&2\nexit 3\n");

        let err = run_bash(&script, &context_in(dir.path()), Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            GuestError::NonZeroExit { code, detail } => {
                assert_eq!(code, 3);
                assert_eq!(detail, "doom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_the_guest() {
        if !runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "slow.sh", "sleep 30\n");

        let err = run_bash(&script, &context_in(dir.path()), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_bash(
            &dir.path().join("absent.sh"),
            &context_in(dir.path()),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GuestError::FileNotFound(_)));
    }
}
