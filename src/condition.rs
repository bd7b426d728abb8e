//! Condition evaluation for conditional branches
//!
//! The branch only needs "expression + parameter set -> bool". [`SimpleEvaluator`]
//! covers the common cases; richer predicate languages plug in through
//! [`ConditionEvaluator`].

use crate::error::{BridgeError, Result};
use crate::parameters::{ParameterSet, Value};

/// Evaluates a boolean expression against the current parameter set
#[cfg_attr(test, mockall::automock)]
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, parameters: &ParameterSet) -> Result<bool>;
}

/// Small built-in expression language.
///
/// Grammar, `&&` binding tighter than `||`:
///
/// ```text
/// expr    := and ( "||" and )*
/// and     := term ( "&&" term )*
/// term    := "true" | "false" | "!" NAME | NAME ( op literal )?
/// op      := "==" | "!=" | ">" | ">=" | "<" | "<="
/// literal := 'text' | "text" | number | true | false | null
/// ```
///
/// A bare `NAME` is truthy when present and not null, false, 0 or "".
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

impl SimpleEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ConditionEvaluator for SimpleEvaluator {
    fn evaluate(&self, expression: &str, parameters: &ParameterSet) -> Result<bool> {
        let fail = |reason: &str| BridgeError::ConditionEvaluation {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        if expression.trim().is_empty() {
            return Err(fail("empty expression"));
        }

        let mut any = false;
        for disjunct in split_unquoted(expression, "||") {
            let mut all = true;
            for term in split_unquoted(disjunct, "&&") {
                // evaluate every term so malformed input is always reported
                let value = evaluate_term(term.trim(), parameters).map_err(|r| fail(&r))?;
                all &= value;
            }
            any |= all;
        }
        Ok(any)
    }
}

/// Split on `separator` where it appears outside '...' or "..." literals
fn split_unquoted<'e>(text: &'e str, separator: &str) -> Vec<&'e str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (index, c) in text.char_indices() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if index >= start && text[index..].starts_with(separator) => {
                parts.push(&text[start..index]);
                start = index + separator.len();
            }
            None => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

fn evaluate_term(term: &str, parameters: &ParameterSet) -> std::result::Result<bool, String> {
    if term.is_empty() {
        return Err("empty term".to_string());
    }
    match term {
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    if let Some(name) = term.strip_prefix('!') {
        let name = name.trim();
        validate_name(name)?;
        return Ok(!truthy(parameters.get(name)));
    }

    let Some((position, op)) = OPERATORS
        .iter()
        .filter_map(|op| term.find(op).map(|pos| (pos, *op)))
        .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
    else {
        validate_name(term)?;
        return Ok(truthy(parameters.get(term)));
    };

    let name = term[..position].trim();
    let literal = parse_literal(term[position + op.len()..].trim())?;
    validate_name(name)?;
    let actual = parameters.get(name).cloned().unwrap_or(Value::Null);

    match op {
        "==" => Ok(loosely_equal(&actual, &literal)),
        "!=" => Ok(!loosely_equal(&actual, &literal)),
        _ => {
            let left = as_number(&actual)
                .ok_or_else(|| format!("parameter '{}' is not numeric", name))?;
            let right = as_number(&literal)
                .ok_or_else(|| format!("'{}' needs a numeric operand", op))?;
            Ok(match op {
                ">" => left > right,
                ">=" => left >= right,
                "<" => left < right,
                _ => left <= right,
            })
        }
    }
}

fn validate_name(name: &str) -> std::result::Result<(), String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid parameter name '{}'", name))
    }
}

fn parse_literal(text: &str) -> std::result::Result<Value, String> {
    if text.is_empty() {
        return Err("missing operand".to_string());
    }
    for quote in ['\'', '"'] {
        if let Some(inner) = text
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Ok(Value::String(inner.to_string()));
        }
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("cannot parse literal '{}'", text))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality where numbers compare by value and strings may hold numbers
fn loosely_equal(actual: &Value, literal: &Value) -> bool {
    match (actual, literal) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::Number(_)) => {
            as_number(actual) == as_number(literal)
        }
        _ => actual == literal,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSet {
        ParameterSet::new()
            .with("Kind", "orders")
            .with("Rows", 42)
            .with("Size", "17")
            .with("Empty", "")
            .with("Done", false)
    }

    fn eval(expression: &str) -> Result<bool> {
        SimpleEvaluator::new().evaluate(expression, &params())
    }

    #[test]
    fn test_literals_and_truthiness() {
        assert!(eval("true").unwrap());
        assert!(!eval("false").unwrap());
        assert!(eval("Kind").unwrap());
        assert!(!eval("Empty").unwrap());
        assert!(!eval("Missing").unwrap());
        assert!(eval("!Done").unwrap());
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("Kind == 'orders'").unwrap());
        assert!(eval("Kind != \"invoices\"").unwrap());
        assert!(eval("Rows == 42").unwrap());
        assert!(eval("Rows >= 42").unwrap());
        assert!(!eval("Rows > 42").unwrap());
        assert!(eval("Size < 20").unwrap());
        assert!(eval("Missing == null").unwrap());
    }

    #[test]
    fn test_operators_inside_quotes_are_literal() {
        let set = ParameterSet::new().with("Name", "a && b").with("Alt", "x || y");
        let evaluator = SimpleEvaluator::new();
        assert!(evaluator.evaluate("Name == 'a && b'", &set).unwrap());
        assert!(evaluator.evaluate("Alt == \"x || y\"", &set).unwrap());
        assert!(evaluator
            .evaluate("Name == 'a && b' && Alt != 'x && y'", &set)
            .unwrap());
        assert!(evaluator.evaluate("Name == 'nope' || Alt == 'x || y'", &set).unwrap());
        assert!(!evaluator.evaluate("Name == 'a || b'", &set).unwrap());
    }

    #[test]
    fn test_split_unquoted() {
        assert_eq!(split_unquoted("a || b", "||"), vec!["a ", " b"]);
        assert_eq!(split_unquoted("a == '||' || b", "||"), vec!["a == '||' ", " b"]);
        assert_eq!(split_unquoted("x", "&&"), vec!["x"]);
    }

    #[test]
    fn test_boolean_operators() {
        assert!(eval("Kind == 'orders' && Rows > 10").unwrap());
        assert!(!eval("Kind == 'orders' && Rows > 100").unwrap());
        assert!(eval("Rows > 100 || Kind == 'orders'").unwrap());
        assert!(eval("false && true || true").unwrap());
    }

    #[test]
    fn test_malformed_expressions_fail() {
        for bad in ["", "Rows >", "Kind == 'a' &&", "Kind > 3", "a b == 1", "Rows > 'x'"] {
            assert!(
                matches!(eval(bad), Err(BridgeError::ConditionEvaluation { .. })),
                "expected failure for {:?}",
                bad
            );
        }
    }
}
