//! Typed resource values

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::uri::{InstanceId, ObjectId};

/// Declared type of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Executable resources carry no value
    None,
    Boolean,
    Integer,
    UnsignedInteger,
    Float,
    String,
    Opaque,
    /// Seconds since the Unix epoch
    Time,
    ObjectLink,
    CoreLink,
}

impl ValueType {
    /// Check if this type is a number type
    pub fn is_number(&self) -> bool {
        matches!(
            self,
            ValueType::Integer | ValueType::UnsignedInteger | ValueType::Float | ValueType::Time
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A typed value carried by a resource record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// No value (read target not yet populated, discover entry, plain execute)
    #[default]
    None,
    Boolean(bool),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    String(String),
    Opaque(Bytes),
    Time(i64),
    ObjectLink(ObjectId, InstanceId),
    CoreLink(String),
    /// Execute argument; only valid for Execute requests
    Argument(Option<Bytes>),
}

impl Value {
    /// Get the type of this value
    ///
    /// `Argument` reports `ValueType::None`, matching executable resources.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::None | Value::Argument(_) => ValueType::None,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) => ValueType::Integer,
            Value::UnsignedInteger(_) => ValueType::UnsignedInteger,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Opaque(_) => ValueType::Opaque,
            Value::Time(_) => ValueType::Time,
            Value::ObjectLink(..) => ValueType::ObjectLink,
            Value::CoreLink(_) => ValueType::CoreLink,
        }
    }

    /// Whether this value may travel with an Execute request
    pub fn is_execute_payload(&self) -> bool {
        matches!(self, Value::None | Value::Argument(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Signed view of any integral value that fits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) | Value::Time(v) => Some(*v),
            Value::UnsignedInteger(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned view of any integral value that fits
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UnsignedInteger(v) => Some(*v),
            Value::Integer(v) | Value::Time(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::UnsignedInteger(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::CoreLink(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Opaque(b) => Some(b),
            Value::Argument(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Whether a write carrying this value is acceptable for `declared`
    ///
    /// Integer-family values are interchangeable as long as they fit;
    /// everything else must match exactly.
    pub fn fits(&self, declared: ValueType) -> bool {
        match (declared, self) {
            (ValueType::Integer, Value::UnsignedInteger(v)) => i64::try_from(*v).is_ok(),
            (ValueType::UnsignedInteger, Value::Integer(v)) => *v >= 0,
            (ValueType::Float, Value::Integer(_) | Value::UnsignedInteger(_)) => true,
            (ValueType::Time, Value::Integer(_)) => true,
            (declared, value) => value.value_type() == declared,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) | Value::Time(v) => write!(f, "{}", v),
            Value::UnsignedInteger(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) | Value::CoreLink(s) => write!(f, "{}", s),
            Value::Opaque(b) => write!(f, "<{} bytes>", b.len()),
            Value::ObjectLink(o, i) => write!(f, "{}:{}", o, i),
            Value::Argument(None) => write!(f, "<no argument>"),
            Value::Argument(Some(b)) => write!(f, "<argument {} bytes>", b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type() {
        assert_eq!(Value::Boolean(true).value_type(), ValueType::Boolean);
        assert_eq!(Value::Argument(None).value_type(), ValueType::None);
        assert_eq!(Value::ObjectLink(3, 0).value_type(), ValueType::ObjectLink);
    }

    #[test]
    fn test_value_fits_declared_type() {
        assert!(Value::Integer(5).fits(ValueType::UnsignedInteger));
        assert!(!Value::Integer(-5).fits(ValueType::UnsignedInteger));
        assert!(Value::UnsignedInteger(7).fits(ValueType::Float));
        assert!(!Value::String("x".into()).fits(ValueType::Integer));
        assert!(Value::Opaque(Bytes::from_static(b"ab")).fits(ValueType::Opaque));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Integer(3).as_u64(), Some(3));
        assert_eq!(Value::Integer(-3).as_u64(), None);
        assert_eq!(Value::String("abc".into()).as_str(), Some("abc"));
        assert!(Value::Argument(Some(Bytes::from_static(b"1"))).is_execute_payload());
        assert!(!Value::Integer(1).is_execute_payload());
    }
}
