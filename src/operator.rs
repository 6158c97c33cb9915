//! Comparison operators applied to an extracted value.

use crate::patterns::CompiledPatterns;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A comparison between the extracted value and the configured one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    /// Pattern must match at the start of the value
    Regex,
    /// Case-insensitive [`Operator::Regex`]
    RegexCi,
    /// Value is absent
    Null,
    EmptyArray,
    ArrayIncludes,
    ValidJsonSchema,
    /// Anything not recognized in configuration
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equals => "equals",
            Operator::Regex => "regex",
            Operator::RegexCi => "regex_ci",
            Operator::Null => "null",
            Operator::EmptyArray => "empty_array",
            Operator::ArrayIncludes => "array_includes",
            Operator::ValidJsonSchema => "valid_json_schema",
            Operator::Unknown(name) => name,
        }
    }
}

impl From<String> for Operator {
    fn from(name: String) -> Self {
        match name.as_str() {
            "equals" => Operator::Equals,
            "regex" => Operator::Regex,
            "regex_ci" | "regex (case-insensitive)" | "regex(i)" => Operator::RegexCi,
            "null" => Operator::Null,
            "empty_array" | "empty array" => Operator::EmptyArray,
            "array_includes" | "array includes" => Operator::ArrayIncludes,
            "valid_json_schema" | "valid JSON schema" => Operator::ValidJsonSchema,
            _ => Operator::Unknown(name),
        }
    }
}

impl From<&str> for Operator {
    fn from(name: &str) -> Self {
        Operator::from(name.to_string())
    }
}

impl From<Operator> for String {
    fn from(operator: Operator) -> Self {
        operator.as_str().to_string()
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply `operator` to the extracted value and the expected operand.
///
/// Never fails: bad patterns, bad schemas and unknown operators are `false`.
pub fn apply(
    patterns: &CompiledPatterns,
    operator: &Operator,
    actual: Option<&Value>,
    expected: &Value,
) -> bool {
    match operator {
        Operator::Equals => actual.is_some_and(|a| values_equal(a, expected)),
        Operator::Regex => regex_match(patterns, actual, expected, false),
        Operator::RegexCi => regex_match(patterns, actual, expected, true),
        Operator::Null => actual.is_none(),
        Operator::EmptyArray => matches!(actual, Some(Value::Array(items)) if items.is_empty()),
        Operator::ArrayIncludes => match actual {
            Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, expected)),
            _ => false,
        },
        Operator::ValidJsonSchema => {
            let validator = match patterns.schema(expected) {
                Ok(validator) => validator,
                Err(e) => {
                    debug!(error = %e, "Invalid JSON schema in condition");
                    return false;
                }
            };
            validator.is_valid(actual.unwrap_or(&Value::Null))
        }
        Operator::Unknown(_) => false,
    }
}

fn regex_match(
    patterns: &CompiledPatterns,
    actual: Option<&Value>,
    expected: &Value,
    case_insensitive: bool,
) -> bool {
    let Some(pattern) = expected.as_str() else {
        debug!(expected = %expected, "Regex operand is not a string");
        return false;
    };
    let regex = match patterns.regex(pattern, case_insensitive) {
        Ok(regex) => regex,
        Err(e) => {
            debug!(pattern, error = %e, "Invalid regex in condition");
            return false;
        }
    };
    let subject = actual.map(stringify).unwrap_or_default();
    // Leftmost-first search: a match at offset 0 exists iff the first match starts there
    regex.find(&subject).is_some_and(|m| m.start() == 0)
}

/// Text form of a value for pattern matching. Strings are used as-is,
/// everything else as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Type-sensitive equality where numbers compare by value (`42 == 42.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}
