//! The IR interpreter.
//!
//! A small stack machine over [`crate::ir::OpList`]: fetch, advance,
//! dispatch.
//! Control flow is nothing but assignments to the program counter with
//! the targets the parser resolved. `include` pushes a frame; returning
//! from the last frame ends the run. The executor is single-threaded
//! cooperative: one op at a time, awaiting only at the suspension points
//! (command, expect, sleep, guest code), every one of which races the
//! run's cancellation token.

pub mod expr;
pub mod vars;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, ApiResult};
use crate::compiler::Compiler;
use crate::config::envfile::EnvFile;
use crate::device::{Device, DeviceError};
use crate::ir::{CompiledScript, Op, ParamError, Value, opnames};
use crate::report::{ResultManager, ResultSink, RunSummary};
use crate::runtime::{Compiled, Runtime};
use crate::sandbox::GuestContext;

use expr::eval_condition;
use vars::VariableStore;

/// Result type for execution.
pub type ExecResult<T> = Result<T, ExecError>;

/// Unrecoverable run errors. Everything else is recorded in the result
/// manager and execution continues.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("line {line}: unknown device section '{name}'")]
    UnknownDevice { line: u32, name: String },

    #[error("line {line}: no device selected")]
    NoDevice { line: u32 },

    #[error("line {line}: device '{device}' error: {source}")]
    Device {
        line: u32,
        device: String,
        #[source]
        source: DeviceError,
    },

    #[error("line {line}: CLI error detected in output of '{command}' on '{device}'")]
    CommandFailed {
        line: u32,
        device: String,
        command: String,
    },

    #[error("line {line}: include cycle: '{file}' is already executing")]
    Cycle { line: u32, file: String },

    #[error("line {line}: failed to include '{file}': {message}")]
    Include {
        line: u32,
        file: String,
        message: String,
    },

    #[error("line {line}: {message}")]
    Expression { line: u32, message: String },

    #[error("line {line}: {source}")]
    Param {
        line: u32,
        #[source]
        source: ParamError,
    },

    #[error("line {line}: {message}")]
    Api { line: u32, message: String },

    #[error("line {line}: operation '{name}' is not registered")]
    UnknownOp { line: u32, name: String },
}

/// Mutable per-run state shared with API handlers.
pub struct RunState {
    pub variables: VariableStore,
    pub devices: HashMap<String, Box<dyn Device>>,
    pub cur_device: Option<String>,
    pub results: ResultManager,
    pub env: EnvFile,
    pub workspace: PathBuf,
    /// Global keep-running policy from the runner config. Device flags
    /// can enable it per device on top of this.
    pub keep_running: bool,
    env_overlay: Vec<(String, String)>,
}

impl RunState {
    pub fn new(
        workspace: PathBuf,
        env: EnvFile,
        devices: HashMap<String, Box<dyn Device>>,
        sinks: Vec<Box<dyn ResultSink>>,
        keep_running: bool,
    ) -> Self {
        let mut variables = VariableStore::new();
        for (key, value) in env.global_vars() {
            variables.set(key, value);
        }
        Self {
            variables,
            devices,
            cur_device: None,
            results: ResultManager::new(sinks),
            env,
            workspace,
            keep_running,
            env_overlay: Vec::new(),
        }
    }

    /// Current device name, empty when none is selected.
    pub fn device_name(&self) -> String {
        self.cur_device.clone().unwrap_or_default()
    }

    pub fn require_device_name(&self) -> ApiResult<String> {
        self.cur_device.clone().ok_or(ApiError::NoDevice)
    }

    pub fn device_mut(&mut self) -> ApiResult<&mut Box<dyn Device>> {
        let name = self.cur_device.as_ref().ok_or(ApiError::NoDevice)?;
        self.devices.get_mut(name).ok_or(ApiError::NoDevice)
    }

    /// Writes to the run-scoped environment overlay (`setenv`).
    pub fn set_env(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.env_overlay.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.env_overlay.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.env_overlay
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Builds the context handed to guest code.
    pub fn guest_context(&self, params: HashMap<String, String>) -> GuestContext {
        let mut device_names: Vec<String> = self.devices.keys().cloned().collect();
        device_names.sort();
        GuestContext {
            last_output: self
                .variables
                .get("last_output")
                .unwrap_or_default()
                .to_string(),
            variables: self.variables.to_map(),
            config: self.env.to_json(),
            config_entries: self
                .env
                .entries()
                .into_iter()
                .map(|(s, k, v)| (s.to_string(), k.to_string(), v.to_string()))
                .collect(),
            workspace: self.workspace.clone(),
            current_device: self.device_name(),
            device_names,
            params,
            env_overlay: self.env_overlay.clone(),
        }
    }

    fn keep_running_for_current_device(&self) -> bool {
        if self.keep_running {
            return true;
        }
        self.cur_device
            .as_ref()
            .and_then(|name| self.devices.get(name))
            .is_some_and(|d| d.keep_running())
    }
}

/// One `include` frame.
struct Frame {
    script: Arc<CompiledScript>,
    pc: usize,
}

/// Interprets compiled scripts against a set of devices.
pub struct Executor {
    runtime: Arc<Runtime>,
    shared: Arc<Compiled>,
    compiler: Compiler,
    pub state: RunState,
    frames: Vec<Frame>,
    cancel: CancellationToken,
    command_settle: Duration,
    run_id: uuid::Uuid,
}

impl Executor {
    /// Creates an executor owning its devices, environment, and sinks
    /// for the duration of one run.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::collections::HashMap;
    /// use std::path::Path;
    /// use std::sync::Arc;
    ///
    /// use fosrun::compiler::Compiler;
    /// use fosrun::config::Config;
    /// use fosrun::config::envfile::EnvFile;
    /// use fosrun::executor::Executor;
    /// use fosrun::report::ConsoleSink;
    /// use fosrun::runtime::Runtime;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let runtime = Arc::new(Runtime::new(Config::default())?);
    ///     let script = Compiler::new(runtime.clone()).compile_file(Path::new("case.fos"))?;
    ///
    ///     let mut executor = Executor::new(
    ///         runtime,
    ///         HashMap::new(), // devices built from config::DeviceConfig entries
    ///         EnvFile::default(),
    ///         vec![Box::new(ConsoleSink::new(false))],
    ///     );
    ///     let summary = executor.run(script).await?;
    ///     println!("{} passed, {} failed", summary.passed, summary.failed);
    ///     Ok(())
    /// }
    /// ```
    pub fn new(
        runtime: Arc<Runtime>,
        devices: HashMap<String, Box<dyn Device>>,
        env: EnvFile,
        sinks: Vec<Box<dyn ResultSink>>,
    ) -> Self {
        let config = runtime.config();
        let state = RunState::new(
            config.runner.workspace.clone(),
            env,
            devices,
            sinks,
            config.runner.keep_running,
        );
        let command_settle = Duration::from_millis(config.runner.expect_poll_ms);
        Self {
            shared: runtime.snapshot(),
            compiler: Compiler::new(runtime.clone()),
            runtime,
            state,
            frames: Vec::new(),
            cancel: CancellationToken::new(),
            command_settle,
            run_id: uuid::Uuid::new_v4(),
        }
    }

    /// Unique identifier of this executor's run, for log correlation.
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Token for the run-level cancel signal.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Final per-QAID reports collected so far.
    pub fn reports(&self) -> Vec<crate::report::QaidReport> {
        self.state.results.get_report()
    }

    /// Runs one compiled script to completion (or cancellation).
    pub async fn run(&mut self, script: Arc<CompiledScript>) -> ExecResult<RunSummary> {
        let started = Instant::now();
        debug!("run {} starting with '{}'", self.run_id, script.file);
        self.shared = self.runtime.ensure_ready();
        self.frames.clear();
        self.frames.push(Frame { script, pc: 0 });

        let cancel = self.cancel.clone();
        loop {
            let op = match self.fetch() {
                Some(op) => op,
                None => break,
            };
            if cancel.is_cancelled() {
                self.state.results.finalize_aborted().await;
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.dispatch(&op) => Some(result),
            };
            match outcome {
                None => {
                    self.state.results.finalize_aborted().await;
                    break;
                }
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    self.state.results.finalize_aborted().await;
                    return Err(e);
                }
            }
        }

        Ok(self.state.results.summary(started.elapsed()))
    }

    /// Fetches the next op, popping completed frames.
    fn fetch(&mut self) -> Option<Op> {
        loop {
            let frame = self.frames.last_mut()?;
            if frame.pc >= frame.script.ops.len() {
                self.frames.pop();
                continue;
            }
            let op = frame.script.ops[frame.pc].clone();
            frame.pc += 1;
            return Some(op);
        }
    }

    fn jump(&mut self, target: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = target;
        }
    }

    fn jump_target(op: &Op, idx: usize) -> ExecResult<usize> {
        op.params
            .get(idx)
            .and_then(Value::as_int)
            .map(|t| t as usize)
            .ok_or_else(|| ExecError::Expression {
                line: op.line,
                message: format!("op '{}' carries no resolved jump target", op.name),
            })
    }

    async fn dispatch(&mut self, op: &Op) -> ExecResult<()> {
        match op.name.as_str() {
            opnames::SWITCH_DEVICE => {
                let name = op.params.first().map(Value::to_text).unwrap_or_default();
                if !self.state.devices.contains_key(&name) {
                    return Err(ExecError::UnknownDevice { line: op.line, name });
                }
                debug!("switching to device '{name}'");
                self.state.cur_device = Some(name);
                Ok(())
            }
            opnames::COMMAND => self.exec_command(op).await,
            opnames::COMMENT => {
                debug!(line = op.line, "comment: {}", op.params.first().map(crate::ir::Value::to_text).unwrap_or_default());
                Ok(())
            }
            opnames::INCLUDE => self.exec_include(op).await,
            opnames::IF_NOT_GOTO => {
                let target = Self::jump_target(op, op.params.len().saturating_sub(1))?;
                let expr = &op.params[..op.params.len() - 1];
                let cond = eval_condition(expr, &self.state.variables).map_err(|e| {
                    ExecError::Expression {
                        line: op.line,
                        message: e.to_string(),
                    }
                })?;
                if !cond {
                    self.jump(target);
                }
                Ok(())
            }
            opnames::ELSEIF | opnames::ELSE => {
                let target = Self::jump_target(op, 0)?;
                self.jump(target);
                Ok(())
            }
            opnames::ENDIF | opnames::LOOP => Ok(()),
            opnames::UNTIL => {
                let begin = Self::jump_target(op, 0)?;
                let cond = eval_condition(&op.params[1..], &self.state.variables).map_err(|e| {
                    ExecError::Expression {
                        line: op.line,
                        message: e.to_string(),
                    }
                })?;
                if !cond {
                    self.jump(begin);
                }
                Ok(())
            }
            name => {
                let handler =
                    self.shared
                        .registry
                        .get(name)
                        .ok_or_else(|| ExecError::UnknownOp {
                            line: op.line,
                            name: name.to_string(),
                        })?;
                match handler.call(&mut self.state, op).await {
                    Ok(()) => Ok(()),
                    Err(ApiError::Device(e)) => self.handle_device_error(op, e).await,
                    Err(ApiError::NoDevice) => Err(ExecError::NoDevice { line: op.line }),
                    Err(ApiError::Param(e)) => Err(ExecError::Param {
                        line: op.line,
                        source: e,
                    }),
                    Err(ApiError::Invalid(message)) => Err(ExecError::Api {
                        line: op.line,
                        message,
                    }),
                }
            }
        }
    }

    /// Sends a raw command line to the current device, captures the
    /// output into `last_output`, and classifies CLI errors.
    async fn exec_command(&mut self, op: &Op) -> ExecResult<()> {
        let raw = op.params.first().map(Value::to_text).unwrap_or_default();
        let text = self.state.variables.expand(&raw);

        let device_name = self
            .state
            .cur_device
            .clone()
            .ok_or(ExecError::NoDevice { line: op.line })?;

        let send_result = {
            let device = self
                .state
                .devices
                .get_mut(&device_name)
                .ok_or(ExecError::NoDevice { line: op.line })?;
            device.send(&text).await
        };
        if let Err(e) = send_result {
            self.state
                .results
                .add_command_error(None, op.line, &text, &e.to_string())
                .await;
            if self.state.keep_running_for_current_device() {
                warn!("device '{device_name}' error on line {}: {e} (keep_running)", op.line);
                return Ok(());
            }
            return Err(ExecError::Device {
                line: op.line,
                device: device_name,
                source: e,
            });
        }

        // Give the transport a beat to produce output before capturing.
        tokio::time::sleep(self.command_settle).await;

        let output = self
            .state
            .devices
            .get(&device_name)
            .map(|d| d.get_buffer())
            .unwrap_or_default();
        self.state.variables.set("last_output", output.as_str());

        let error_patterns = &self.runtime.config().errors.patterns;
        if error_patterns.iter().any(|p| output.contains(p.as_str())) {
            self.state
                .results
                .add_command_error(None, op.line, &text, &output)
                .await;
            if !self.state.keep_running_for_current_device() {
                return Err(ExecError::CommandFailed {
                    line: op.line,
                    device: device_name,
                    command: text,
                });
            }
            warn!("CLI error on '{device_name}' line {} (keep_running)", op.line);
        }
        Ok(())
    }

    /// Compiles (or re-uses) the included file and enters it.
    async fn exec_include(&mut self, op: &Op) -> ExecResult<()> {
        let raw = op.params.first().map(Value::to_text).unwrap_or_default();
        // Symbolic parts resolve from the variable store first, then from
        // the environment file's sections.
        let expanded = self.state.variables.expand(&raw);
        let resolved = self.state.env.resolve_refs(&expanded);
        let path = self.state.workspace.join(&resolved);
        let file_key = path.display().to_string();

        if self.frames.iter().any(|f| f.script.file == file_key) {
            return Err(ExecError::Cycle {
                line: op.line,
                file: file_key,
            });
        }

        let script = self
            .compiler
            .compile_file(&path)
            .map_err(|e| ExecError::Include {
                line: op.line,
                file: file_key,
                message: e.to_string(),
            })?;
        debug!("entering include '{}'", script.file);
        self.frames.push(Frame { script, pc: 0 });
        Ok(())
    }

    async fn handle_device_error(&mut self, op: &Op, error: DeviceError) -> ExecResult<()> {
        let device_name = self.state.device_name();
        self.state
            .results
            .add_command_error(None, op.line, &op.name, &error.to_string())
            .await;
        if self.state.keep_running_for_current_device() {
            warn!(
                "device '{device_name}' error on line {}: {error} (keep_running)",
                op.line
            );
            // Best-effort session recovery before the next op.
            if let Ok(device) = self.state.device_mut()
                && let Err(login_err) = device.force_login().await
            {
                warn!("re-login on '{device_name}' failed: {login_err}");
            }
            return Ok(());
        }
        Err(ExecError::Device {
            line: op.line,
            device: device_name,
            source: error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReplayRule, ScriptedDeviceConfig};
    use crate::device::scripted::ScriptedDevice;
    use crate::report::{NullSink, QaidStatus};

    fn test_runtime(workspace: &std::path::Path) -> Arc<Runtime> {
        let mut config = Config::default();
        config.runner.workspace = workspace.to_path_buf();
        config.runner.expect_poll_ms = 5;
        Arc::new(Runtime::new(config).unwrap())
    }

    fn scripted(rules: Vec<(&str, &str)>, preload: &str) -> Box<dyn Device> {
        let config = ScriptedDeviceConfig {
            responses: rules
                .into_iter()
                .map(|(when, output)| ReplayRule {
                    when: when.to_string(),
                    output: output.to_string(),
                })
                .collect(),
            ..Default::default()
        };
        let mut dev = ScriptedDevice::new("FGT1", &config).unwrap();
        if !preload.is_empty() {
            dev.push_output(preload);
        }
        Box::new(dev)
    }

    fn executor_with(workspace: &std::path::Path, devices: Vec<(&str, Box<dyn Device>)>) -> Executor {
        let runtime = test_runtime(workspace);
        let devices: HashMap<String, Box<dyn Device>> = devices
            .into_iter()
            .map(|(name, dev)| (name.to_string(), dev))
            .collect();
        Executor::new(runtime, devices, EnvFile::default(), vec![Box::new(NullSink)])
    }

    fn compile_in(executor: &mut Executor, source: &str) -> Arc<CompiledScript> {
        executor.compiler.compile_str(source, "test.fos").unwrap()
    }

    #[tokio::test]
    async fn test_positional_api_plus_expect_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(
            dir.path(),
            vec![("FGT1", scripted(vec![], "Welcome\nlogin: "))],
        );
        let script = compile_in(
            &mut exec,
            "[FGT1]\n<setvar ip \"192.168.1.1\">\n<expect -e \"login:\" -for QA001 -t 10>\n",
        );

        let summary = exec.run(script).await.unwrap();
        assert_eq!(summary.total_qaids, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(exec.state.variables.get("ip"), Some("192.168.1.1"));
        assert_eq!(exec.state.results.record_count("QA001"), 1);
        assert_eq!(exec.reports()[0].status, QaidStatus::Pass);
    }

    #[tokio::test]
    async fn test_if_else_reports_pass_when_expect_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], "FGT-60F # "))]);
        let script = compile_in(
            &mut exec,
            "[FGT1]\n\
             <expect -e \"#\" -for QA005 -t 5>\n\
             <if $? == 0>\n\
             <report -qaid QA100 -result pass>\n\
             <else>\n\
             <report -qaid QA100 -result fail>\n\
             <fi>\n",
        );

        exec.run(script).await.unwrap();
        let reports = exec.reports();
        let qa100 = reports.iter().find(|r| r.qaid == "QA100").unwrap();
        assert_eq!(qa100.status, QaidStatus::Pass);
        // Exactly one branch ran.
        assert_eq!(qa100.details.len(), 1);
    }

    #[tokio::test]
    async fn test_if_else_reports_fail_when_expect_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], "no prompt here"))]);
        let script = compile_in(
            &mut exec,
            "[FGT1]\n\
             <expect -e \"#\" -for QA005 -t 0>\n\
             <if $? == 0>\n\
             <report -qaid QA100 -result pass>\n\
             <else>\n\
             <report -qaid QA100 -result fail>\n\
             <fi>\n",
        );

        exec.run(script).await.unwrap();
        let reports = exec.reports();
        let qa100 = reports.iter().find(|r| r.qaid == "QA100").unwrap();
        assert_eq!(qa100.status, QaidStatus::Fail);
    }

    #[tokio::test]
    async fn test_command_sets_last_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(
            dir.path(),
            vec![(
                "FGT1",
                scripted(vec![("get system status", "Version: FortiGate-60F 7.4.1")], ""),
            )],
        );
        let script = compile_in(&mut exec, "[FGT1]\nget system status\n");

        exec.run(script).await.unwrap();
        assert!(
            exec.state
                .variables
                .get("last_output")
                .unwrap()
                .contains("7.4.1")
        );
    }

    #[tokio::test]
    async fn test_command_interpolates_variables() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(
            dir.path(),
            vec![("FGT1", scripted(vec![("ping 10.0.0.7", "alive")], ""))],
        );
        let script = compile_in(&mut exec, "[FGT1]\n<setvar target \"10.0.0.7\">\nping $target\n");

        exec.run(script).await.unwrap();
        assert!(exec.state.variables.get("last_output").unwrap().contains("alive"));
    }

    #[tokio::test]
    async fn test_cli_error_is_fatal_without_keep_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(
            dir.path(),
            vec![("FGT1", scripted(vec![("get bogus", "Unknown action 0")], ""))],
        );
        let script = compile_in(&mut exec, "[FGT1]\nget bogus\n");

        let err = exec.run(script).await.unwrap_err();
        assert!(matches!(err, ExecError::CommandFailed { .. }));
        assert_eq!(exec.state.results.command_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_cli_error_continues_with_keep_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = ScriptedDevice::new(
            "FGT1",
            &ScriptedDeviceConfig {
                responses: vec![ReplayRule {
                    when: "get bogus".to_string(),
                    output: "Unknown action 0".to_string(),
                }],
                ..Default::default()
            },
        )
        .unwrap();
        dev.set_keep_running(true);

        let dir_path = dir.path();
        let mut exec = executor_with(dir_path, vec![("FGT1", Box::new(dev))]);
        let script = compile_in(&mut exec, "[FGT1]\nget bogus\n<setvar after \"yes\">\n");

        exec.run(script).await.unwrap();
        assert_eq!(exec.state.variables.get("after"), Some("yes"));
        assert_eq!(exec.state.results.command_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_until_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(
            &mut exec,
            "<intset n 0>\n<loop>\n<intchange n + 1>\n<until $n == 3>\n",
        );

        exec.run(script).await.unwrap();
        assert_eq!(exec.state.variables.get("n"), Some("3"));
    }

    #[tokio::test]
    async fn test_while_loop_runs_to_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(
            &mut exec,
            "<intset n 0>\n<while $n < 4>\n<intchange n + 1>\n<endwhile>\n",
        );

        exec.run(script).await.unwrap();
        assert_eq!(exec.state.variables.get("n"), Some("4"));
    }

    #[tokio::test]
    async fn test_check_var_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(
            &mut exec,
            "<setvar host \"fw-lab-1\">\n\
             <check_var host -value \"fw-lab-1\" -for QA_V>\n\
             <check_var host -pattern \"^fw-\" -for QA_P>\n\
             <check_var host -contains \"lab\" -for QA_C>\n\
             <check_var host -value \"other\" -for QA_BAD>\n",
        );

        exec.run(script).await.unwrap();
        let by_qaid = |q: &str| {
            exec.reports()
                .into_iter()
                .find(|r| r.qaid == q)
                .unwrap()
                .status
        };
        assert_eq!(by_qaid("QA_V"), QaidStatus::Pass);
        assert_eq!(by_qaid("QA_P"), QaidStatus::Pass);
        assert_eq!(by_qaid("QA_C"), QaidStatus::Pass);
        assert_eq!(by_qaid("QA_BAD"), QaidStatus::Fail);
    }

    #[tokio::test]
    async fn test_check_var_first_declared_predicate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        // -value is declared before -pattern; the failing pattern is
        // ignored.
        let script = compile_in(
            &mut exec,
            "<setvar host \"fw-lab-1\">\n\
             <check_var host -value \"fw-lab-1\" -pattern \"^zzz\" -for QA_FIRST>\n",
        );

        exec.run(script).await.unwrap();
        assert_eq!(exec.reports()[0].status, QaidStatus::Pass);
    }

    #[tokio::test]
    async fn test_include_executes_and_shares_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("common.fos"), "<setvar from_include \"1\">\n").unwrap();

        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(&mut exec, "include common.fos\n<check_var from_include -value \"1\" -for QA_I>\n");

        exec.run(script).await.unwrap();
        assert_eq!(exec.reports()[0].status, QaidStatus::Pass);
    }

    #[tokio::test]
    async fn test_include_cycle_is_rejected_at_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.fos"), "include b.fos\n").unwrap();
        std::fs::write(dir.path().join("b.fos"), "include a.fos\n").unwrap();

        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        // Compiling the entry script succeeds; the cycle only exists at
        // run time.
        let script = compile_in(&mut exec, "include a.fos\n");

        let err = exec.run(script).await.unwrap_err();
        assert!(matches!(err, ExecError::Cycle { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_empty_script_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![]);
        let script = compile_in(&mut exec, "");

        let summary = exec.run(script).await.unwrap();
        assert_eq!(summary.total_qaids, 0);
        assert!(summary.success());
    }

    #[tokio::test]
    async fn test_section_only_script_runs_no_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(&mut exec, "[FGT1]\n");

        let summary = exec.run(script).await.unwrap();
        assert_eq!(summary.total_qaids, 0);
        assert_eq!(exec.state.cur_device.as_deref(), Some("FGT1"));
    }

    #[tokio::test]
    async fn test_unknown_section_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(&mut exec, "[UNKNOWN_BOX]\n");

        let err = exec.run(script).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_command_without_section_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(&mut exec, "get system status\n");

        let err = exec.run(script).await.unwrap_err();
        assert!(matches!(err, ExecError::NoDevice { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_run_marks_in_flight_qaids_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], "login: "))]);
        let script = compile_in(
            &mut exec,
            "[FGT1]\n<expect -e \"login:\" -for QA_A -t 1>\n<sleep -t 30>\n<report -qaid QA_A -result pass>\n",
        );

        let cancel = exec.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let summary = exec.run(script).await.unwrap();
        assert_eq!(summary.aborted, 1);
        assert_eq!(exec.reports()[0].status, QaidStatus::Aborted);
    }

    #[tokio::test]
    async fn test_exec_code_bash_round_trip() {
        if !crate::sandbox::runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hostname.sh"), "echo fw-lab-1\n").unwrap();

        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(
            &mut exec,
            "<exec_code -lang bash -var h -file \"hostname.sh\">\n\
             <check_var h -value \"fw-lab-1\" -for QA_H>\n",
        );

        exec.run(script).await.unwrap();
        assert_eq!(exec.reports()[0].status, QaidStatus::Pass);
    }

    #[tokio::test]
    async fn test_exec_code_failure_clears_var_and_continues() {
        if !crate::sandbox::runtime_available("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boom.sh"), "exit 9\n").unwrap();

        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(
            &mut exec,
            "<setvar r \"stale\">\n\
             <exec_code -lang bash -var r -file \"boom.sh\">\n\
             <setvar after \"yes\">\n",
        );

        exec.run(script).await.unwrap();
        assert!(exec.state.variables.get("r").is_none());
        assert_eq!(exec.state.variables.get("after"), Some("yes"));
        assert_eq!(exec.state.results.command_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_getenv_setenv_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor_with(dir.path(), vec![("FGT1", scripted(vec![], ""))]);
        let script = compile_in(
            &mut exec,
            "<setenv LAB_SLOT 7>\n<getenv LAB_SLOT slot>\n<check_var slot -value \"7\" -for QA_E>\n",
        );

        exec.run(script).await.unwrap();
        assert_eq!(exec.reports()[0].status, QaidStatus::Pass);
        // The parent process environment is untouched.
        assert!(std::env::var("LAB_SLOT").is_err());
    }

    #[tokio::test]
    async fn test_env_file_seeds_variables() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let env = EnvFile::parse("VERSION: 7.4.1\n[FGT1]\nip: 10.0.0.1\n").unwrap();
        let mut devices: HashMap<String, Box<dyn Device>> = HashMap::new();
        devices.insert(
            "FGT1".to_string(),
            scripted(vec![], ""),
        );
        let mut exec = Executor::new(runtime, devices, env, vec![Box::new(NullSink)]);
        let script = compile_in(&mut exec, "<check_var VERSION -value \"7.4.1\" -for QA_G>\n");

        exec.run(script).await.unwrap();
        assert_eq!(exec.reports()[0].status, QaidStatus::Pass);
    }
}
