//! API registry and dispatch.
//!
//! Every op name that is not a control-flow mnemonic resolves to an
//! [`Api`] handler here. Built-ins are registered at phase 1; discovered
//! plugin APIs join during the phase-2 merge, with built-ins keeping
//! precedence on name collisions. The registry is frozen after phase 2
//! and read-only during execution.

pub mod builtins;
pub mod exec_code;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::device::DeviceError;
use crate::discovery::DiscoveredApi;
use crate::executor::RunState;
use crate::ir::{Op, ParamError};
use crate::sandbox::{GuestError, bash, python};

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced by API handlers to the executor.
///
/// Assertion misses and guest failures are not errors: handlers record
/// those and return `Ok`. Only conditions the executor must arbitrate
/// (device trouble, bad parameters) come back as `ApiError`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("no device selected (add a [SECTION] header before this op)")]
    NoDevice,

    /// Malformed argument values (bad language name, bad regex, ...).
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A named, schema-declared operation invokable from a script.
#[async_trait]
pub trait Api: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()>;
}

/// Name → handler mapping. Frozen after phase 2.
#[derive(Clone, Default)]
pub struct ApiRegistry {
    handlers: HashMap<String, Arc<dyn Api>>,
}

impl ApiRegistry {
    /// Registry with every built-in handler installed.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for api in builtins::all() {
            registry.handlers.insert(api.name().to_string(), api);
        }
        registry
    }

    /// Registers a handler; returns `false` (and leaves the existing
    /// entry) when the name is taken.
    pub fn register(&mut self, api: Arc<dyn Api>) -> bool {
        let name = api.name().to_string();
        if self.handlers.contains_key(&name) {
            return false;
        }
        self.handlers.insert(name, api);
        true
    }

    /// Installs handlers for discovered plugin APIs. Built-ins win.
    pub fn merge_discovered(&mut self, discovered: &[DiscoveredApi]) {
        for api in discovered {
            let handler = Arc::new(PluginApi {
                name: api.name.clone(),
                path: api.path.clone(),
                lang: api.lang.clone(),
            });
            if !self.register(handler) {
                warn!(
                    "plugin API '{}' collides with a built-in; built-in wins",
                    api.name
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Api>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered API names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Handler for a discovered plugin API: runs the plugin's guest script
/// with the op's flags in the context, and stores the guest's result in
/// the variable named by a `-var` flag when one is present.
pub struct PluginApi {
    name: String,
    path: std::path::PathBuf,
    lang: String,
}

const PLUGIN_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
impl Api for PluginApi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let pairs = plugin_params(op);

        let mut params = HashMap::new();
        for (flag, value) in &pairs {
            params.insert(
                flag.trim_start_matches('-').to_string(),
                state.variables.expand(value),
            );
        }

        let timeout = view
            .named_int("timeout")
            .ok()
            .flatten()
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(PLUGIN_TIMEOUT);

        let context = state.guest_context(params);
        let result = match self.lang.as_str() {
            "python" => python::run_python(&self.path, None, None, &context, timeout).await,
            "bash" => bash::run_bash(&self.path, &context, timeout).await,
            "javascript" => {
                bash::run_program("javascript", "node", &self.path, &context, timeout).await
            }
            "ruby" => bash::run_program("ruby", "ruby", &self.path, &context, timeout).await,
            other => Err(GuestError::UnsupportedLang(other.to_string())),
        };

        match result {
            Ok(outcome) => {
                for (name, value) in outcome.variable_writes {
                    state.variables.set(name, value);
                }
                if let Some(var) = view.named_text("var")
                    && let Some(value) = outcome.value
                {
                    state.variables.set(var, value);
                }
                Ok(())
            }
            Err(e) => {
                let what = format!("plugin '{}'", self.name);
                state
                    .results
                    .add_guest_error(op.line, &what, &e.to_string())
                    .await;
                Ok(())
            }
        }
    }
}

/// `(flag, value)` pairs of a plugin call, for open and declared schemas
/// alike.
fn plugin_params(op: &Op) -> Vec<(String, String)> {
    let view = op.view();
    match &op.api {
        Some(api) if !api.open_options => api
            .options
            .iter()
            .filter_map(|p| view.named_text(&p.alias).map(|v| (p.flag.clone(), v)))
            .collect(),
        _ => view.open_pairs(),
    }
}
