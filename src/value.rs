//! Host dynamic value type.
//!
//! [`Value`] is the tagged union that crosses the host/script boundary.
//! Every attribute read, attribute write, callback payload and diagnostic
//! query is expressed with it. Conversion to and from Lua lives in
//! [`crate::lua::codec`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Tagged dynamic value shared between the host and scripts.
///
/// `None` is the explicit "no value" marker: unsupported script objects
/// degrade to it instead of failing conversion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent or unrepresentable value.
    #[default]
    None,
    /// Boolean scalar.
    Bool(bool),
    /// Signed integer scalar.
    Int(i64),
    /// Floating point scalar.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered sequence of nested values.
    Seq(Vec<Value>),
    /// Raw byte buffer (frames, binary attributes).
    Buffer(Bytes),
}

impl Value {
    /// Returns `true` for [`Value::None`].
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Short tag name, used in log messages and attribute descriptions.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Seq(_) => "values",
            Self::Buffer(_) => "buffer",
        }
    }

    /// Borrow the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view. Floats are truncated, booleans map to 0/1.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of numeric values.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrow the sequence payload, if any.
    #[must_use]
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Seq(values) => Some(values),
            _ => None,
        }
    }

    /// Build a `[key, value]` pair, the shape mappings take on the host side.
    #[must_use]
    pub fn pair(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self::Seq(vec![key.into(), value.into()])
    }

    /// Returns `true` when this is a 2-element sequence with a scalar key,
    /// i.e. something that can become a mapping entry.
    #[must_use]
    pub fn is_pair(&self) -> bool {
        match self {
            Self::Seq(items) if items.len() == 2 => matches!(
                items[0],
                Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_)
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Buffer(b) => write!(f, "<buffer {} bytes>", b.len()),
            Self::Seq(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Buffer(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Self::Seq(values)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::None, Into::into)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::Seq(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_none() {
        assert!(Value::default().is_none());
    }

    #[test]
    fn test_pair_detection() {
        assert!(Value::pair("width", 512).is_pair());
        assert!(Value::pair(1, "one").is_pair());
        assert!(!Value::Seq(vec![Value::from(1)]).is_pair());
        assert!(!Value::pair(Value::Seq(vec![]), 1).is_pair());
        assert!(!Value::from("width").is_pair());
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::from(3.9).as_i64(), Some(3));
        assert_eq!(Value::from(true).as_i64(), Some(1));
        assert_eq!(Value::from(2).as_f64(), Some(2.0));
        assert_eq!(Value::from("2").as_f64(), None);
    }

    #[test]
    fn test_display_nested() {
        let v = Value::Seq(vec![Value::from(1), Value::pair("a", 2.5), Value::None]);
        assert_eq!(v.to_string(), "[1, [a, 2.5], none]");
    }

    #[test]
    fn test_json_shape() {
        let v = Value::Seq(vec![Value::from(1), Value::from("x"), Value::None]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"[1,"x",null]"#);

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
