//! Condition expression evaluation.
//!
//! Expressions reach the executor as the token texts the parser captured:
//! variables (with their `$` sigil), numeric literals, string literals,
//! and operators. Grammar, lowest precedence first:
//!
//! ```text
//! condition  := additive [ cmp-op additive ]
//! additive   := term { (+|-) term }
//! term       := factor { (*|/) factor }
//! factor     := variable | number | literal
//! ```
//!
//! Symbolic comparisons (`== != < <= > >=`) compare numerically when both
//! sides parse as integers and fall back to literal string comparison;
//! the word forms (`eq ne lt gt le ge`) always compare strings. A bare
//! operand is truthy when non-empty and not `"0"`.

use crate::ir::Value;

use super::vars::VariableStore;

/// Result type for expression evaluation.
pub type EvalResult<T> = Result<T, EvalError>;

/// An expression that could not be evaluated.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

const CMP_OPS: &[&str] = &[
    "==", "!=", "<", "<=", ">", ">=", "eq", "ne", "lt", "gt", "le", "ge",
];

/// Evaluates a condition expression to a boolean.
pub fn eval_condition(tokens: &[Value], vars: &VariableStore) -> EvalResult<bool> {
    let mut cursor = Cursor {
        tokens,
        pos: 0,
        vars,
    };
    let left = cursor.additive()?;

    let result = match cursor.peek_op(CMP_OPS) {
        Some(op) => {
            cursor.pos += 1;
            let right = cursor.additive()?;
            compare(&left, &op, &right)?
        }
        None => truthy(&left),
    };

    if cursor.pos != tokens.len() {
        return Err(EvalError::new(format!(
            "trailing tokens in expression after position {}",
            cursor.pos
        )));
    }
    Ok(result)
}

/// An evaluated operand: kept as text, with numeric interpretation on
/// demand.
#[derive(Debug, Clone)]
struct Operand(String);

impl Operand {
    fn as_int(&self) -> Option<i64> {
        self.0.trim().parse().ok()
    }
}

struct Cursor<'a> {
    tokens: &'a [Value],
    pos: usize,
    vars: &'a VariableStore,
}

impl Cursor<'_> {
    fn peek_text(&self) -> Option<String> {
        self.tokens.get(self.pos).map(Value::to_text)
    }

    fn peek_op(&self, ops: &[&str]) -> Option<String> {
        self.peek_text().filter(|t| ops.contains(&t.as_str()))
    }

    fn additive(&mut self) -> EvalResult<Operand> {
        let mut acc = self.term()?;
        while let Some(op) = self.peek_op(&["+", "-"]) {
            self.pos += 1;
            let rhs = self.term()?;
            acc = arithmetic(&acc, &op, &rhs)?;
        }
        Ok(acc)
    }

    fn term(&mut self) -> EvalResult<Operand> {
        let mut acc = self.factor()?;
        while let Some(op) = self.peek_op(&["*", "/"]) {
            self.pos += 1;
            let rhs = self.factor()?;
            acc = arithmetic(&acc, &op, &rhs)?;
        }
        Ok(acc)
    }

    fn factor(&mut self) -> EvalResult<Operand> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| EvalError::new("expression ended where an operand was expected"))?;
        self.pos += 1;

        let text = token.to_text();
        if let Some(name) = variable_name(&text) {
            return Ok(Operand(self.vars.get_or_warn(name)));
        }
        Ok(Operand(text))
    }
}

/// Extracts the variable name from `$NAME` / `{$NAME}` forms.
fn variable_name(text: &str) -> Option<&str> {
    let inner = text
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(text);
    inner.strip_prefix('$')
}

fn arithmetic(left: &Operand, op: &str, right: &Operand) -> EvalResult<Operand> {
    let (Some(l), Some(r)) = (left.as_int(), right.as_int()) else {
        return Err(EvalError::new(format!(
            "arithmetic '{op}' needs integer operands, got '{}' and '{}'",
            left.0, right.0
        )));
    };
    let value = match op {
        "+" => l.wrapping_add(r),
        "-" => l.wrapping_sub(r),
        "*" => l.wrapping_mul(r),
        "/" => {
            if r == 0 {
                return Err(EvalError::new("division by zero"));
            }
            l / r
        }
        _ => return Err(EvalError::new(format!("unknown arithmetic operator '{op}'"))),
    };
    Ok(Operand(value.to_string()))
}

fn compare(left: &Operand, op: &str, right: &Operand) -> EvalResult<bool> {
    let result = match op {
        // Symbolic operators: numeric when both sides are integers,
        // literal string comparison otherwise.
        "==" | "!=" | "<" | "<=" | ">" | ">=" => {
            let ordering = match (left.as_int(), right.as_int()) {
                (Some(l), Some(r)) => l.cmp(&r),
                _ => left.0.cmp(&right.0),
            };
            match op {
                "==" => ordering.is_eq(),
                "!=" => ordering.is_ne(),
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                _ => unreachable!("covered by the outer match"),
            }
        }
        // Word operators always compare as strings.
        "eq" => left.0 == right.0,
        "ne" => left.0 != right.0,
        "lt" => left.0 < right.0,
        "gt" => left.0 > right.0,
        "le" => left.0 <= right.0,
        "ge" => left.0 >= right.0,
        other => return Err(EvalError::new(format!("unknown comparison '{other}'"))),
    };
    Ok(result)
}

fn truthy(operand: &Operand) -> bool {
    !operand.0.is_empty() && operand.0 != "0"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> VariableStore {
        let mut vars = VariableStore::new();
        vars.set("?", "0");
        vars.set("count", "3");
        vars.set("name", "fgt-a");
        vars
    }

    fn eval(tokens: &[Value]) -> bool {
        eval_condition(tokens, &vars()).unwrap()
    }

    fn toks(parts: &[&str]) -> Vec<Value> {
        parts
            .iter()
            .map(|p| {
                p.parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::Str(p.to_string()))
            })
            .collect()
    }

    #[test]
    fn test_status_comparison() {
        assert!(eval(&toks(&["$?", "==", "0"])));
        assert!(!eval(&toks(&["$?", "==", "1"])));
        assert!(eval(&toks(&["$?", "!=", "1"])));
    }

    #[test]
    fn test_numeric_relations() {
        assert!(eval(&toks(&["$count", "<", "5"])));
        assert!(eval(&toks(&["$count", ">=", "3"])));
        assert!(!eval(&toks(&["$count", ">", "10"])));
    }

    #[test]
    fn test_string_equality_is_literal() {
        assert!(eval(&toks(&["$name", "==", "fgt-a"])));
        assert!(eval(&toks(&["$name", "ne", "fgt-b"])));
        // "10" vs "9": numeric for ==, lexicographic for word forms.
        assert!(eval(&toks(&["10", "gt", "0"])) == ("10" > "0"));
        assert!(!eval(&toks(&["10", "==", "9"])));
    }

    #[test]
    fn test_arithmetic_with_precedence() {
        // 1 + 2 * 3 == 7
        assert!(eval(&toks(&["1", "+", "2", "*", "3", "==", "7"])));
        assert!(eval(&toks(&["$count", "+", "1", "==", "4"])));
        assert!(eval(&toks(&["10", "/", "2", "-", "1", "==", "4"])));
    }

    #[test]
    fn test_truthiness_without_operator() {
        assert!(eval(&toks(&["$count"])));
        assert!(!eval(&toks(&["$?"])));
        let empty_vars = VariableStore::new();
        assert!(!eval_condition(&toks(&["$missing"]), &empty_vars).unwrap());
    }

    #[test]
    fn test_unknown_variable_is_empty_string() {
        // empty vs "" equality through a comparison against empty literal
        let store = VariableStore::new();
        let result = eval_condition(&toks(&["$ghost", "eq", ""]), &store);
        // "" is lexed as a string token that is empty
        assert!(result.unwrap());
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let err = eval_condition(&toks(&["1", "/", "0"]), &vars()).unwrap_err();
        assert!(err.message.contains("division"));
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        let err = eval_condition(&toks(&["1", "==", "1", "2"]), &vars()).unwrap_err();
        assert!(err.message.contains("trailing"));
    }

    #[test]
    fn test_non_numeric_arithmetic_is_an_error() {
        let err = eval_condition(&toks(&["abc", "+", "1"]), &vars()).unwrap_err();
        assert!(err.message.contains("integer"));
    }
}
