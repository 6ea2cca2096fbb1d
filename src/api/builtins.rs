//! Built-in API handlers.
//!
//! These implement the schema's declared built-ins: assertions (`expect`,
//! `check_var`), reporting (`report`), variable mutation (`setvar`,
//! `strset`, `intset`, `intchange`, `setenv`, `getenv`), pacing (`sleep`),
//! and guest code execution (`exec_code`, in [`super::exec_code`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{Api, ApiError, ApiResult, exec_code::ExecCodeApi};
use crate::executor::RunState;
use crate::ir::{Op, ParamError};

/// All built-in handlers, for registry construction.
pub fn all() -> Vec<Arc<dyn Api>> {
    vec![
        Arc::new(ExpectApi),
        Arc::new(ReportApi),
        Arc::new(CheckVarApi),
        Arc::new(ExecCodeApi),
        Arc::new(SleepApi),
        Arc::new(SetTextApi { name: "setvar" }),
        Arc::new(SetTextApi { name: "strset" }),
        Arc::new(IntsetApi),
        Arc::new(IntchangeApi),
        Arc::new(SetenvApi),
        Arc::new(GetenvApi),
    ]
}

fn missing(alias: &str) -> ApiError {
    ApiError::Param(ParamError::Missing {
        alias: alias.to_string(),
    })
}

/// `expect -e PATTERN -for QAID [-t SECS] [-fail match|unmatch]`
///
/// Polls the current device's buffer until the pattern matches or the
/// timeout elapses, records the outcome under the QAID, and sets `$?` to
/// `0` on pass / `1` on fail.
pub struct ExpectApi;

#[async_trait]
impl Api for ExpectApi {
    fn name(&self) -> &str {
        "expect"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let pattern = state.variables.expand(&view.require_text("pattern")?);
        let qaid = view.require_text("qaid")?;
        let timeout = view.named_int("timeout")?.unwrap_or(10).max(0) as u64;
        let fail_mode = view
            .named_text("fail_mode")
            .unwrap_or_else(|| "unmatch".to_string());

        let device_name = state.require_device_name()?;
        let (matched, output) = state
            .device_mut()?
            .expect(&pattern, Duration::from_secs(timeout))
            .await?;

        let inverted = fail_mode == "match";
        let passed = if inverted { !matched } else { matched };
        state.variables.set("?", if passed { "0" } else { "1" });

        let rule = if inverted {
            format!("expect no '{pattern}' within {timeout}s")
        } else {
            format!("expect '{pattern}' within {timeout}s")
        };
        state
            .results
            .add_expect(&qaid, passed, &rule, &output, op.line, &device_name)
            .await;
        Ok(())
    }
}

/// `report -qaid QAID -result pass|fail [-msg TEXT]`
///
/// Adds one direct assertion and finalizes the QAID.
pub struct ReportApi;

#[async_trait]
impl Api for ReportApi {
    fn name(&self) -> &str {
        "report"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let qaid = view.require_text("qaid")?;
        let result = view.require_text("result")?;
        let passed = match result.as_str() {
            "pass" => true,
            "fail" => false,
            other => {
                return Err(ApiError::Invalid(format!(
                    "report -result must be 'pass' or 'fail', got '{other}'"
                )));
            }
        };
        let message = view
            .named_text("message")
            .unwrap_or_else(|| format!("reported {result}"));

        let device = state.device_name();
        state
            .results
            .add_report(&qaid, passed, &message, op.line, &device)
            .await;
        state.results.finalize(&qaid).await;
        Ok(())
    }
}

/// `check_var NAME (-value V | -pattern P | -contains S) [-for QAID]
/// [-fail match|unmatch]`
///
/// When several predicates are supplied, the first one in schema order
/// wins and the rest are ignored.
pub struct CheckVarApi;

#[async_trait]
impl Api for CheckVarApi {
    fn name(&self) -> &str {
        "check_var"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let name = view.require_text("name")?;
        let qaid = view.named_text("qaid");
        let fail_mode = view
            .named_text("fail_mode")
            .unwrap_or_else(|| "unmatch".to_string());
        let actual = state.variables.get_or_warn(&name);

        let predicate_order: Vec<String> = match &op.api {
            Some(api) => api
                .options
                .iter()
                .map(|p| p.alias.clone())
                .filter(|a| matches!(a.as_str(), "value" | "pattern" | "contains"))
                .collect(),
            None => vec![
                "value".to_string(),
                "pattern".to_string(),
                "contains".to_string(),
            ],
        };

        let mut outcome: Option<(String, bool)> = None;
        for alias in predicate_order {
            let Some(raw) = view.named_text(&alias) else {
                continue;
            };
            let expected = state.variables.expand(&raw);
            outcome = Some(match alias.as_str() {
                "value" => (format!("{name} == '{expected}'"), actual == expected),
                "pattern" => {
                    let re = Regex::new(&expected).map_err(|e| {
                        ApiError::Invalid(format!("check_var pattern '{expected}': {e}"))
                    })?;
                    (format!("{name} matches /{expected}/"), re.is_match(&actual))
                }
                _ => (
                    format!("{name} contains '{expected}'"),
                    actual.contains(&expected),
                ),
            });
            break;
        }

        let Some((description, matched)) = outcome else {
            return Err(ApiError::Invalid(
                "check_var requires one of -value, -pattern or -contains".to_string(),
            ));
        };

        let passed = if fail_mode == "match" {
            !matched
        } else {
            matched
        };
        state.variables.set("?", if passed { "0" } else { "1" });

        let device = state.device_name();
        state
            .results
            .add_check_var(qaid.as_deref(), passed, &description, op.line, &device)
            .await;
        Ok(())
    }
}

/// `sleep [-t SECS]`
pub struct SleepApi;

#[async_trait]
impl Api for SleepApi {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn call(&self, _state: &mut RunState, op: &Op) -> ApiResult<()> {
        let seconds = op.view().named_int("seconds")?.unwrap_or(1).max(0) as u64;
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(())
    }
}

/// `setvar NAME VALUE` / `strset NAME VALUE`
pub struct SetTextApi {
    pub name: &'static str,
}

#[async_trait]
impl Api for SetTextApi {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let name = view.text_at(0).ok_or_else(|| missing("name"))?;
        let raw = view.text_at(1).ok_or_else(|| missing("value"))?;
        let value = state.variables.expand(&raw);
        state.variables.set(name, value);
        Ok(())
    }
}

/// `intset NAME VALUE`
pub struct IntsetApi;

#[async_trait]
impl Api for IntsetApi {
    fn name(&self) -> &str {
        "intset"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let name = view.text_at(0).ok_or_else(|| missing("name"))?;
        let raw = view.text_at(1).ok_or_else(|| missing("value"))?;
        let value: i64 = state.variables.expand(&raw).trim().parse().map_err(|_| {
            ApiError::Invalid(format!("intset value '{raw}' is not an integer"))
        })?;
        state.variables.set(name, value.to_string());
        Ok(())
    }
}

/// `intchange NAME OP VALUE`: integer arithmetic update in place.
pub struct IntchangeApi;

#[async_trait]
impl Api for IntchangeApi {
    fn name(&self) -> &str {
        "intchange"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let name = view.text_at(0).ok_or_else(|| missing("name"))?;
        let operator = view.text_at(1).ok_or_else(|| missing("op"))?;
        let raw = view.text_at(2).ok_or_else(|| missing("value"))?;

        let delta: i64 = state.variables.expand(&raw).trim().parse().map_err(|_| {
            ApiError::Invalid(format!("intchange value '{raw}' is not an integer"))
        })?;
        let current_text = state.variables.get(&name).unwrap_or("0").to_string();
        let current: i64 = current_text.trim().parse().map_err(|_| {
            ApiError::Invalid(format!(
                "variable '{name}' holds '{current_text}', which is not an integer"
            ))
        })?;

        let next = match operator.as_str() {
            "+" | "add" => current.wrapping_add(delta),
            "-" | "sub" => current.wrapping_sub(delta),
            "*" | "mul" => current.wrapping_mul(delta),
            "/" | "div" => {
                if delta == 0 {
                    return Err(ApiError::Invalid("intchange division by zero".to_string()));
                }
                current / delta
            }
            other => {
                return Err(ApiError::Invalid(format!(
                    "intchange operator '{other}' is not one of + - * / add sub mul div"
                )));
            }
        };
        state.variables.set(name, next.to_string());
        Ok(())
    }
}

/// `setenv KEY VALUE`: run-scoped environment overlay, injected into
/// guest subprocesses. Never touches the parent process environment.
pub struct SetenvApi;

#[async_trait]
impl Api for SetenvApi {
    fn name(&self) -> &str {
        "setenv"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let key = view.text_at(0).ok_or_else(|| missing("key"))?;
        let raw = view.text_at(1).ok_or_else(|| missing("value"))?;
        let value = state.variables.expand(&raw);
        state.set_env(&key, &value);
        Ok(())
    }
}

/// `getenv KEY VAR`: reads the overlay first, then the real environment.
pub struct GetenvApi;

#[async_trait]
impl Api for GetenvApi {
    fn name(&self) -> &str {
        "getenv"
    }

    async fn call(&self, state: &mut RunState, op: &Op) -> ApiResult<()> {
        let view = op.view();
        let key = view.text_at(0).ok_or_else(|| missing("key"))?;
        let var = view.text_at(1).ok_or_else(|| missing("var"))?;

        let value = state
            .get_env(&key)
            .or_else(|| std::env::var(&key).ok())
            .unwrap_or_else(|| {
                tracing::warn!("environment key '{key}' is not set; storing empty string");
                String::new()
            });
        state.variables.set(var, value);
        Ok(())
    }
}
