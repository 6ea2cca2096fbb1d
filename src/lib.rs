//! # fosrun
//!
//! A schema-driven compiler and executor for FOS, a domain-specific test
//! automation language for network-device regression testing. Scripts
//! describe CLI commands, expectations, device context switches, file
//! includes, and control flow; fosrun compiles them to a linear IR and
//! interprets it against live or scripted devices, recording per-assertion
//! outcomes keyed by test-case identifiers (QAIDs).
//!
//! ## Architecture
//!
//! The crate is organized around three subsystems:
//!
//! ### Compiler ([`schema`], [`lexer`], [`parser`], [`compiler`])
//!
//! A single JSON schema declares APIs, keywords, and token fragments; the
//! loader compiles it into combined regex tables, the lexer classifies
//! lines and tokenizes payloads, and the parser validates the token
//! stream and emits an [`ir::OpList`] with resolved jump targets.
//! Initialization is two-phase: built-ins at startup, plugin discovery
//! merged exactly once before the first compilation ([`runtime`],
//! [`discovery`]).
//!
//! ### Executor ([`executor`], [`api`], [`report`])
//!
//! A stack-machine interpreter over the IR: device context, control flow
//! via forward/backward jumps, a run-scoped variable store, and include
//! frames with cycle detection. Non-mnemonic ops dispatch through the
//! [`api::ApiRegistry`]; assertion outcomes flow into the
//! [`report::ResultManager`] and out to [`report::ResultSink`]s.
//!
//! ### Sandbox ([`sandbox`])
//!
//! The `exec_code` API runs guest Python, Bash, JavaScript, or Ruby as
//! subprocesses with a controlled context. Python goes through a bundled
//! harness that rebuilds the restricted environment (safe builtins,
//! whitelist importer); every guest gets a fresh environment copy, so
//! mutations never leak back into the run.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use fosrun::compiler::Compiler;
//! use fosrun::config::Config;
//! use fosrun::config::envfile::EnvFile;
//! use fosrun::executor::Executor;
//! use fosrun::report::NullSink;
//! use fosrun::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(Runtime::new(Config::default())?);
//!
//!     let mut compiler = Compiler::new(runtime.clone());
//!     let script = compiler.compile_file(std::path::Path::new("case.fos"))?;
//!
//!     let devices = HashMap::new(); // build from config::DeviceConfig entries
//!     let mut executor = Executor::new(runtime, devices, EnvFile::default(), vec![Box::new(NullSink)]);
//!     let summary = executor.run(script).await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod api;
pub mod bundled;
pub mod compiler;
pub mod config;
pub mod device;
pub mod discovery;
pub mod executor;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod report;
pub mod runtime;
pub mod sandbox;
pub mod schema;

// Re-export commonly used types for convenience.

pub use compiler::{CompileError, Compiler};
pub use config::{Config, load_config};
pub use device::Device;
pub use executor::{ExecError, Executor};
pub use ir::{CompiledScript, Op, OpList, Value};
pub use report::{QaidReport, QaidStatus, ResultSink, RunSummary, print_summary};
pub use runtime::Runtime;
