//! Runner configuration loading and schema definitions.
//!
//! The runner's own settings live in a TOML file (`fos.toml`): workspace
//! location, schema override, device stand-ins, plugin discovery bounds,
//! reporting, deprecated-command rewrites, and CLI-error classification.
//! String path fields support `${VAR}` / `${VAR:-default}` environment
//! references and `~` expansion.
//!
//! The script-facing environment file (INI `KEY: VALUE` pairs with
//! `DEVICE:VARIABLE` resolution) is separate; see [`envfile`].

pub mod envfile;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Device stand-ins by section name.
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,

    #[serde(default)]
    pub report: ReportConfig,

    /// Deprecated-command rewrite table. Optional; an absent table
    /// disables the rewrite pass entirely.
    #[serde(default)]
    pub deprecated: Vec<DeprecatedEntry>,

    #[serde(default)]
    pub errors: ErrorsConfig,
}

/// Core runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Workspace root; guest code files and includes resolve against it.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Optional schema document replacing the bundled default.
    pub schema: Option<PathBuf>,

    /// Optional environment file (INI) for config variables.
    pub env_file: Option<PathBuf>,

    /// Turn device-level runtime errors into recorded failures instead of
    /// fatal halts.
    #[serde(default)]
    pub keep_running: bool,

    /// Polling interval for `expect` when the device buffers passively.
    #[serde(default = "default_expect_poll_ms")]
    pub expect_poll_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            schema: None,
            env_file: None,
            keep_running: false,
            expect_poll_ms: default_expect_poll_ms(),
        }
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_expect_poll_ms() -> u64 {
    250
}

/// Plugin discovery bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Root directory scanned for plugin API scripts.
    #[serde(default = "default_plugin_dir")]
    pub dir: PathBuf,

    /// Maximum walk depth below `dir`.
    #[serde(default = "default_plugin_depth")]
    pub max_depth: usize,

    /// Scan deadline; a pathological directory must not hang the process.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    /// Ignore the memoized scan result and rescan on the next compile.
    #[serde(default)]
    pub force_refresh: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            max_depth: default_plugin_depth(),
            scan_timeout_ms: default_scan_timeout_ms(),
            force_refresh: false,
        }
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins/apis")
}

fn default_plugin_depth() -> usize {
    3
}

fn default_scan_timeout_ms() -> u64 {
    2000
}

/// One device stand-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    /// Drives a local shell as a pseudo test PC.
    Process(ProcessDeviceConfig),
    /// Replays canned responses; used for dry runs and tests.
    Scripted(ScriptedDeviceConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDeviceConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for the shell; defaults to the workspace.
    pub working_dir: Option<PathBuf>,

    /// Record this device's runtime errors instead of halting the run.
    #[serde(default)]
    pub keep_running: bool,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedDeviceConfig {
    /// Canned rules applied in order: first regex match on a sent command
    /// appends its output to the device buffer.
    #[serde(default)]
    pub responses: Vec<ReplayRule>,

    /// Record this device's runtime errors instead of halting the run.
    #[serde(default)]
    pub keep_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRule {
    /// Regex matched against the sent command text.
    pub when: String,
    pub output: String,
}

/// Reporting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub junit: bool,

    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: false,
            junit_file: default_junit_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

/// One deprecated-command rewrite rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprecatedEntry {
    /// Cheap prefix pre-filter checked before the regex.
    pub prefix: String,
    pub pattern: String,
    pub replacement: String,
}

/// CLI-error classification for command output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    /// Substrings marking a command's output as a CLI error.
    #[serde(default = "default_error_patterns")]
    pub patterns: Vec<String>,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            patterns: default_error_patterns(),
        }
    }
}

fn default_error_patterns() -> Vec<String> {
    vec![
        "Unknown action".to_string(),
        "Command fail".to_string(),
        "command parse error".to_string(),
    ]
}

/// Loads runner configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// a required `${VAR}` environment reference is unset.
///
/// # Example
///
/// ```no_run
/// use fosrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fos.toml"))?;
/// println!("workspace: {}", config.runner.workspace.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    expand_config_paths(&mut config)?;

    Ok(config)
}

/// Loads runner configuration from a TOML string.
///
/// Useful for testing and embedding configuration programmatically.
///
/// # Example
///
/// ```
/// use fosrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     keep_running = true
///
///     [plugins]
///     dir = "my-plugins"
/// "#)?;
///
/// assert!(config.runner.keep_running);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    expand_config_paths(&mut config)?;

    Ok(config)
}

/// Substitutes environment references in a config string.
///
/// `${VAR}` reads the variable and fails when it is unset; `${VAR:-text}`
/// falls back to `text` instead; `$$` escapes a literal dollar sign. A
/// bare `$word` passes through untouched (that form belongs to runtime
/// variables, not the environment).
fn expand_env_value(value: &str) -> Result<String, String> {
    static ENV_REF: OnceLock<Regex> = OnceLock::new();
    let pattern = ENV_REF.get_or_init(|| {
        Regex::new(r"\$\$|\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<fallback>[^}]*))?\}")
            .expect("env reference pattern is valid")
    });

    let mut failure: Option<String> = None;
    let expanded = pattern.replace_all(value, |caps: &regex::Captures<'_>| {
        let Some(name) = caps.name("name") else {
            // The `$$` escape.
            return "$".to_string();
        };
        match std::env::var(name.as_str()) {
            Ok(v) => v,
            Err(_) => match caps.name("fallback") {
                Some(fallback) => fallback.as_str().to_string(),
                None => {
                    failure = Some(format!(
                        "environment variable '{}' is not set",
                        name.as_str()
                    ));
                    String::new()
                }
            },
        }
    });

    if let Some(message) = failure {
        return Err(message);
    }
    // Anything the pattern left behind is a reference it could not parse.
    if expanded.contains("${") {
        return Err(format!("malformed ${{...}} reference in '{value}'"));
    }
    Ok(expanded.into_owned())
}

/// Applies `${VAR}` and `~` expansion to the path-like config fields.
fn expand_config_paths(config: &mut Config) -> Result<()> {
    let expand = |path: &Path| -> Result<PathBuf> {
        let text = path.to_string_lossy();
        let env_expanded = expand_env_value(&text).map_err(anyhow::Error::msg)?;
        let tilde_expanded = shellexpand::tilde(&env_expanded);
        Ok(PathBuf::from(tilde_expanded.as_ref()))
    };

    config.runner.workspace = expand(&config.runner.workspace)?;
    if let Some(schema) = &config.runner.schema {
        config.runner.schema = Some(expand(schema)?);
    }
    if let Some(env_file) = &config.runner.env_file {
        config.runner.env_file = Some(expand(env_file)?);
    }
    config.plugins.dir = expand(&config.plugins.dir)?;
    config.report.output_dir = expand(&config.report.output_dir)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.runner.workspace, PathBuf::from("."));
        assert!(!config.runner.keep_running);
        assert_eq!(config.plugins.dir, PathBuf::from("plugins/apis"));
        assert_eq!(config.plugins.max_depth, 3);
        assert!(config.deprecated.is_empty());
        assert!(!config.errors.patterns.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let config = load_config_str(
            r#"
            [runner]
            workspace = "scripts"
            env_file = "env.cfg"
            keep_running = true

            [plugins]
            dir = "my-plugins"
            scan_timeout_ms = 500

            [devices.FGT1]
            type = "scripted"
            responses = [{ when = "get system status", output = "Version: 7.4" }]

            [devices.PC1]
            type = "process"
            shell = "/bin/bash"

            [report]
            output_dir = "out"
            junit = true

            [[deprecated]]
            prefix = "diag sys"
            pattern = "^diag sys"
            replacement = "diagnose sys"
            "#,
        )
        .unwrap();

        assert!(config.runner.keep_running);
        assert_eq!(config.devices.len(), 2);
        assert!(matches!(
            config.devices.get("FGT1"),
            Some(DeviceConfig::Scripted(_))
        ));
        assert!(matches!(
            config.devices.get("PC1"),
            Some(DeviceConfig::Process(_))
        ));
        assert_eq!(config.deprecated.len(), 1);
        assert!(config.report.junit);
    }

    #[test]
    fn test_env_expansion_in_workspace() {
        // SAFETY: test-local variable name, no concurrent reader depends on it.
        unsafe { std::env::set_var("FOSRUN_TEST_WS", "/tmp/ws") };
        let config = load_config_str(
            r#"
            [runner]
            workspace = "${FOSRUN_TEST_WS}/cases"
            "#,
        )
        .unwrap();
        assert_eq!(config.runner.workspace, PathBuf::from("/tmp/ws/cases"));
    }

    #[test]
    fn test_env_expansion_default_and_escape() {
        assert_eq!(
            expand_env_value("${FOSRUN_UNSET_VAR:-fallback}").unwrap(),
            "fallback"
        );
        assert_eq!(expand_env_value("a$$b").unwrap(), "a$b");
        assert!(expand_env_value("${FOSRUN_UNSET_VAR}").is_err());
    }

    #[test]
    fn test_env_expansion_leaves_runtime_variables_alone() {
        assert_eq!(expand_env_value("ping $ip").unwrap(), "ping $ip");
    }

    #[test]
    fn test_env_expansion_rejects_malformed_reference() {
        assert!(expand_env_value("${never closed").is_err());
    }
}
