//! Scalar coercer: recovers typed values from stringified CSV cells.
//!
//! Tabular input stringifies everything. Without a schema the original type
//! is guessed from the text alone, in this order:
//!
//! 1. empty cell → `Null`
//! 2. JSON object/array shape (unless the column is exempt) → `Object`/`Array`
//! 3. `true`/`false` literal → `Bool`
//! 4. decimal or scientific number → `Int`/`Float`
//! 5. anything else → `String`
//!
//! This is a heuristic, kept behind [`coerce_scalar`] so it can be tested on
//! its own and replaced by a schema-driven coercer later.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::Value;

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+\.?|\.\d+|\d+\.\d+)([eE][+-]?\d+)?$")
        .expect("numeric pattern is valid")
});

/// Outcome of coercing one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub value: Value,
    /// Set when the text looked like JSON but did not parse. The raw string
    /// is kept as the value in that case.
    pub ambiguity: Option<String>,
}

impl Coerced {
    fn clean(value: Value) -> Self {
        Self { value, ambiguity: None }
    }
}

/// Coerce one cell. `json_exempt` disables step 2 for columns that carry
/// legitimate brace-containing text (formula languages and the like).
pub fn coerce_scalar(raw: &str, json_exempt: bool) -> Coerced {
    if raw.is_empty() {
        return Coerced::clean(Value::Null);
    }

    let trimmed = raw.trim();

    if !json_exempt && looks_like_json(trimmed) {
        return match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(parsed) => Coerced::clean(Value::from(parsed)),
            Err(e) => Coerced {
                value: Value::String(raw.to_owned()),
                ambiguity: Some(e.to_string()),
            },
        };
    }

    match trimmed {
        "true" | "TRUE" | "True" => return Coerced::clean(Value::Bool(true)),
        "false" | "FALSE" | "False" => return Coerced::clean(Value::Bool(false)),
        _ => {}
    }

    if let Some(number) = parse_number(trimmed) {
        return Coerced::clean(number);
    }

    Coerced::clean(Value::String(raw.to_owned()))
}

fn looks_like_json(s: &str) -> bool {
    (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']'))
}

fn parse_number(s: &str) -> Option<Value> {
    if !NUMERIC.is_match(s) {
        return None;
    }
    let integral = !s.contains(['.', 'e', 'E']);
    if integral {
        if let Ok(i) = s.parse::<i64>() {
            return Some(Value::Int(i));
        }
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Value::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coerce(raw: &str) -> Value {
        coerce_scalar(raw, false).value
    }

    #[test]
    fn test_empty_is_null() {
        assert_eq!(coerce(""), Value::Null);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(coerce("42"), Value::Int(42));
        assert_eq!(coerce("-7"), Value::Int(-7));
        assert_eq!(coerce("3.5"), Value::Float(3.5));
        assert_eq!(coerce("1e3"), Value::Float(1000.0));
        assert_eq!(coerce("2.5E-2"), Value::Float(0.025));
        assert_eq!(coerce(".5"), Value::Float(0.5));
        // beyond i64 falls back to float
        assert_eq!(coerce("99999999999999999999"), Value::Float(1e20));
    }

    #[test]
    fn test_not_numbers() {
        assert_eq!(coerce("NaN"), Value::from("NaN"));
        assert_eq!(coerce("inf"), Value::from("inf"));
        assert_eq!(coerce("1.2.3"), Value::from("1.2.3"));
        assert_eq!(coerce("12abc"), Value::from("12abc"));
        assert_eq!(coerce("1e"), Value::from("1e"));
    }

    #[test]
    fn test_booleans() {
        assert_eq!(coerce("true"), Value::Bool(true));
        assert_eq!(coerce("FALSE"), Value::Bool(false));
        assert_eq!(coerce("yes"), Value::from("yes"));
    }

    #[test]
    fn test_json_object_and_array() {
        let v = coerce(r#"{"a": 1, "b": {"c": "d"}}"#);
        assert_eq!(v.pointer(["b", "c"]), Some(&Value::from("d")));
        assert_eq!(coerce("[1, 2]"), Value::Array(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_malformed_json_kept_as_string() {
        let c = coerce_scalar("{not json}", false);
        assert_eq!(c.value, Value::from("{not json}"));
        assert!(c.ambiguity.is_some());
    }

    #[test]
    fn test_exempt_column_skips_json() {
        let c = coerce_scalar("{x} > 3", true);
        assert_eq!(c.value, Value::from("{x} > 3"));
        assert!(c.ambiguity.is_none());

        let c = coerce_scalar(r#"{"a": 1}"#, true);
        assert_eq!(c.value, Value::from(r#"{"a": 1}"#));
    }

    #[test]
    fn test_brace_inside_text_is_not_json() {
        assert_eq!(coerce("a {b} c"), Value::from("a {b} c"));
    }
}
