//! The `exec_code` API.
//!
//! `exec_code -lang python|bash|javascript|ruby -var DEST -file PATH
//! [-func NAME] [-args CSV] [-timeout SECS]`
//!
//! Runs the guest file through the sandbox (see [`crate::sandbox`]) and
//! stores the captured result under the destination variable. Guest
//! failures clear the destination variable, record a failure, and let the
//! script continue.

use std::time::Duration;

use async_trait::async_trait;

use super::{Api, ApiError, ApiResult};
use crate::executor::RunState;
use crate::ir::Op;
use crate::sandbox::{GuestError, bash, python};

pub struct ExecCodeApi;

#[async_trait]
impl Api for ExecCodeApi {
    fn name(&self) -> &str {
        "exec_code"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let lang = view.require_text("lang")?;
        let var = view.require_text("var")?;
        let file = state.variables.expand(&view.require_text("file")?);
        let func = view.named_text("func");
        let args = view.named_text("args").map(|a| state.variables.expand(&a));
        let timeout =
            Duration::from_secs(view.named_int("timeout")?.unwrap_or(30).max(0) as u64);

        let path = state.workspace.join(&file);
        let context = state.guest_context(Default::default());

        let result = match lang.as_str() {
            "python" => {
                python::run_python(&path, func.as_deref(), args.as_deref(), &context, timeout).await
            }
            "bash" => bash::run_bash(&path, &context, timeout).await,
            "javascript" => bash::run_program("javascript", "node", &path, &context, timeout).await,
            "ruby" => bash::run_program("ruby", "ruby", &path, &context, timeout).await,
            other => Err(GuestError::UnsupportedLang(other.to_string())),
        };

        match result {
            Ok(outcome) => {
                for (name, value) in outcome.variable_writes {
                    state.variables.set(name, value);
                }
                match outcome.value {
                    Some(value) => state.variables.set(var, value),
                    None => state.variables.unset(&var),
                }
                Ok(())
            }
            Err(GuestError::UnsupportedLang(other)) => Err(ApiError::Invalid(format!(
                "exec_code language '{other}' is not one of python, bash, javascript, ruby"
            ))),
            Err(e) => {
                // Guest failure: destination cleared, failure recorded,
                // execution continues.
                state.variables.unset(&var);
                let what = format!("exec_code -lang {lang} -file {file}");
                state
                    .results
                    .add_guest_error(op.line, &what, &e.to_string())
                    .await;
                Ok(())
            }
        }
    }
}
