//! Universal value type for twin and relationship properties.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::PropertyMap;

/// JSON-compatible property value.
///
/// Covers everything a canonical document can carry:
/// - Scalars: Bool, Int, Float, String
/// - Containers: Array, Object
///
/// `Int` and `Float` together form the numeric case; the split keeps
/// integer cells exact through a round trip.
///
/// On the wire a `Value` is plain JSON (no type tags).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(PropertyMap),
}

// ============================================================================
// Type checking
// ============================================================================

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }
    pub fn is_number(&self) -> bool { matches!(self, Value::Int(_) | Value::Float(_)) }
    pub fn is_object(&self) -> bool { matches!(self, Value::Object(_)) }

    /// Delete-marker truthiness: `true` or the number `1`.
    pub fn is_flag_set(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i == 1,
            Value::Float(f) => *f == 1.0,
            _ => false,
        }
    }

    /// Attempt to extract as &str
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Attempt to extract as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&PropertyMap> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Follow a sequence of object keys. `None` as soon as a step is missing
    /// or lands on a non-object.
    pub fn pointer<'a, I>(&self, keys: I) -> Option<&Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut cur = self;
        for key in keys {
            cur = cur.as_object()?.get(key)?;
        }
        Some(cur)
    }
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int(v as i64) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_owned()) } }
impl From<PropertyMap> for Value { fn from(v: PropertyMap) -> Self { Value::Object(v) } }
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::Array(v.into_iter().map(Into::into).collect()) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(Value::Null) }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                // u64 above i64::MAX and every fractional number land here
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            // JSON has no NaN/Infinity
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(a) => serde_json::Value::Array(a.into_iter().map(Into::into).collect()),
            Value::Object(m) => {
                serde_json::Value::Object(m.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Value::Array(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Object(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
        assert_eq!(Value::from(42), Value::Int(42));
        assert_eq!(Value::from(3.25), Value::Float(3.25));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_json_conversion_keeps_integers_exact() {
        let json: serde_json::Value = serde_json::json!({"a": 7, "b": 2.5, "c": [true, null]});
        let value = Value::from(json.clone());

        assert_eq!(value.pointer(["a"]), Some(&Value::Int(7)));
        assert_eq!(value.pointer(["b"]), Some(&Value::Float(2.5)));
        assert_eq!(serde_json::Value::from(value), json);
    }

    #[test]
    fn test_non_finite_float_serializes_as_null() {
        let json = serde_json::to_string(&Value::Float(f64::INFINITY)).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn test_flag_truthiness() {
        assert!(Value::Bool(true).is_flag_set());
        assert!(Value::Int(1).is_flag_set());
        assert!(!Value::Int(2).is_flag_set());
        assert!(!Value::String("true".into()).is_flag_set());
        assert!(!Value::Null.is_flag_set());
    }

    #[test]
    fn test_pointer_stops_at_scalars() {
        let v = Value::from(serde_json::json!({"a": {"b": 1}}));
        assert_eq!(v.pointer(["a", "b"]), Some(&Value::Int(1)));
        assert_eq!(v.pointer(["a", "b", "c"]), None);
        assert_eq!(v.pointer(["x"]), None);
    }
}
