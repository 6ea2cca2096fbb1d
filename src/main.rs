//! fosrun CLI - compile and run FOS regression scripts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fosrun::compiler::Compiler;
use fosrun::config::{self, Config};
use fosrun::config::envfile::EnvFile;
use fosrun::device::{Device, build_device};
use fosrun::executor::Executor;
use fosrun::report::{ConsoleSink, QaidReport, ResultSink, print_summary, write_junit};
use fosrun::runtime::Runtime;
use fosrun::schema::ApiOrigin;

#[derive(Parser)]
#[command(name = "fosrun")]
#[command(about = "FOS test automation script runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fos.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute scripts
    Run {
        /// Script files to run, in order
        scripts: Vec<PathBuf>,

        /// Override the environment file from the config
        #[arg(long)]
        env: Option<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Compile scripts without executing them
    Check {
        /// Script files to check
        scripts: Vec<PathBuf>,

        /// Print the compiled IR as JSON
        #[arg(long)]
        emit_ir: bool,
    },

    /// List registered APIs (built-ins plus discovered plugins)
    Apis {
        /// Rescan the plugin directory before listing
        #[arg(long)]
        refresh: bool,
    },

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run {
            scripts,
            env,
            junit,
        } => run_scripts(&cli.config, &scripts, env, junit, cli.verbose).await,
        Commands::Check { scripts, emit_ir } => check_scripts(&cli.config, &scripts, emit_ir),
        Commands::Apis { refresh } => list_apis(&cli.config, refresh),
        Commands::Init => init_config(),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fosrun: {e:#}");
            std::process::exit(2);
        }
    }
}

/// Loads the config file, falling back to defaults when the default path
/// does not exist.
fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else if path == Path::new("fos.toml") {
        info!("no fos.toml found; using defaults");
        Ok(Config::default())
    } else {
        anyhow::bail!("config file {} does not exist", path.display());
    }
}

fn resolve_in_workspace(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

async fn build_devices(config: &Config) -> Result<HashMap<String, Box<dyn Device>>> {
    let poll = std::time::Duration::from_millis(config.runner.expect_poll_ms);
    let mut devices = HashMap::new();
    for (name, device_config) in &config.devices {
        let device = build_device(name, device_config, poll)
            .await
            .with_context(|| format!("failed to set up device '{name}'"))?;
        devices.insert(name.clone(), device);
    }
    Ok(devices)
}

async fn run_scripts(
    config_path: &Path,
    scripts: &[PathBuf],
    env_override: Option<PathBuf>,
    junit_override: Option<PathBuf>,
    verbose: bool,
) -> Result<i32> {
    if scripts.is_empty() {
        anyhow::bail!("no scripts given; usage: fosrun run <script.fos>...");
    }

    let config = load_or_default(config_path)?;
    let runtime = Arc::new(Runtime::new(config.clone()).context("schema initialization failed")?);

    let env_path = env_override.or_else(|| config.runner.env_file.clone());
    let env = match env_path {
        Some(path) => {
            let path = resolve_in_workspace(&config.runner.workspace, &path);
            EnvFile::load(&path)
                .with_context(|| format!("failed to load environment file {}", path.display()))?
        }
        None => EnvFile::default(),
    };

    let progress = if scripts.len() > 1 {
        let bar = indicatif::ProgressBar::new(scripts.len() as u64);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} scripts")
                .context("progress template")?
                .progress_chars("#>-"),
        );
        Some(bar)
    } else {
        None
    };

    let mut all_reports: Vec<QaidReport> = Vec::new();
    let mut failed = false;
    let mut total_errors = 0usize;
    let started = std::time::Instant::now();

    for script_path in scripts {
        info!("running {}", script_path.display());

        let mut compiler = Compiler::new(runtime.clone());
        let script = compiler
            .compile_file(script_path)
            .with_context(|| format!("failed to compile {}", script_path.display()))?;

        // Devices are owned exclusively by one run; build a fresh set
        // for every script.
        let devices = build_devices(&config).await?;
        let sinks: Vec<Box<dyn ResultSink>> = vec![Box::new(ConsoleSink::new(verbose))];
        let mut executor = Executor::new(runtime.clone(), devices, env.clone(), sinks);

        let cancel = executor.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let summary = executor
            .run(script)
            .await
            .with_context(|| format!("run of {} failed", script_path.display()))?;

        failed |= !summary.success();
        total_errors += summary.command_errors;
        all_reports.extend(executor.reports());

        if let Some(bar) = &progress {
            bar.inc(1);
        }
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    let merged = merge_summary(&all_reports, total_errors, started.elapsed());
    print_summary(&all_reports, &merged);

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        // A broken report sink never changes the run's outcome.
        if let Err(e) = write_junit(&junit_path, &all_reports, &merged) {
            tracing::error!("failed to write JUnit XML to {}: {e}", junit_path.display());
        }
    }

    Ok(if failed { 1 } else { 0 })
}

fn merge_summary(
    reports: &[QaidReport],
    command_errors: usize,
    duration: std::time::Duration,
) -> fosrun::RunSummary {
    use fosrun::QaidStatus;
    fosrun::RunSummary {
        total_qaids: reports.len(),
        passed: reports
            .iter()
            .filter(|r| r.status == QaidStatus::Pass)
            .count(),
        failed: reports
            .iter()
            .filter(|r| r.status == QaidStatus::Fail)
            .count(),
        aborted: reports
            .iter()
            .filter(|r| r.status == QaidStatus::Aborted)
            .count(),
        command_errors,
        duration,
    }
}

fn check_scripts(config_path: &Path, scripts: &[PathBuf], emit_ir: bool) -> Result<i32> {
    if scripts.is_empty() {
        anyhow::bail!("no scripts given; usage: fosrun check <script.fos>...");
    }

    let config = load_or_default(config_path)?;
    let runtime = Arc::new(Runtime::new(config).context("schema initialization failed")?);
    let mut compiler = Compiler::new(runtime);

    let mut code = 0;
    for script_path in scripts {
        match compiler.compile_file(script_path) {
            Ok(script) => {
                println!(
                    "{}: ok ({} ops, {} devices, {} includes)",
                    script_path.display(),
                    script.ops.len(),
                    script.devices.len(),
                    script.includes.len()
                );
                if emit_ir {
                    println!("{}", serde_json::to_string_pretty(&script.ops)?);
                }
            }
            Err(e) => {
                eprintln!("{}: {e}", script_path.display());
                code = 2;
            }
        }
    }
    Ok(code)
}

fn list_apis(config_path: &Path, refresh: bool) -> Result<i32> {
    let config = load_or_default(config_path)?;
    let runtime = Runtime::new(config).context("schema initialization failed")?;
    let snapshot = if refresh {
        runtime.force_refresh()
    } else {
        runtime.ensure_ready()
    };

    let mut names: Vec<&str> = snapshot.schema.api_names().collect();
    names.sort_unstable();
    for name in names {
        let api = snapshot.schema.api(name).expect("name listed above");
        let origin = match &api.origin {
            ApiOrigin::Builtin => "builtin".to_string(),
            ApiOrigin::Plugin { path, lang } => format!("{lang} plugin ({})", path.display()),
        };
        println!("{name:<20} {:<10} {origin}", api.category);
    }
    Ok(0)
}

fn init_config() -> Result<i32> {
    let config = r#"# fosrun configuration file

[runner]
workspace = "."
env_file = "env.cfg"
keep_running = false

[plugins]
dir = "plugins/apis"

# Scripted devices replay canned responses; process devices drive a
# local shell. Real transports register through the Device trait.
[devices.FGT1]
type = "scripted"
responses = [
    { when = "get system status", output = "Version: FortiGate-60F v7.4.1\nFGT-60F # " },
]

[devices.PC1]
type = "process"
shell = "/bin/sh"

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#;

    let env = r#"VERSION: 7.4.1
[FGT1]
ip: 192.168.1.99
admin: admin
"#;

    let sample = r#"#[Sample regression case]
[FGT1]
get system status
<expect -e "FortiGate" -for QA001 -t 10>
<if $? == 0>
<report -qaid QA001 -result pass>
<else>
<report -qaid QA001 -result fail>
<fi>
"#;

    for (path, content) in [
        ("fos.toml", config),
        ("env.cfg", env),
        ("sample.fos", sample),
    ] {
        if Path::new(path).exists() {
            eprintln!("{path} already exists. Remove it first or edit manually.");
            return Ok(2);
        }
        std::fs::write(path, content)?;
        println!("Created {path}");
    }

    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  fosrun run sample.fos");

    Ok(0)
}
