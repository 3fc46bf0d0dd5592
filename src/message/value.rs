//! Polymorphic message values
//!
//! The wire dictionary maps string keys to values of a small set of kinds.
//! [`Value`] is the tagged union covering those kinds; the typed accessors
//! return `None` rather than panicking when a key holds the wrong kind, so
//! callers can treat a mistyped value exactly like an absent one.

use std::collections::BTreeMap;

use bytes::Bytes;

/// A single value in a message dictionary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer
    Int(i64),
    /// UTF-8 string
    Str(String),
    /// Opaque byte string
    Bytes(Bytes),
    /// Heterogeneous list
    List(Vec<Value>),
    /// Homogeneous integer list
    IntList(Vec<i64>),
    /// Nested mapping with sorted keys
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Get the integer value, if this is an [`Value::Int`]
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string value, if this is a [`Value::Str`]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the byte string, if this is a [`Value::Bytes`]
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get the list, if this is a [`Value::List`]
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get the integer list, if this is a [`Value::IntList`]
    #[must_use]
    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            Self::IntList(items) => Some(items),
            _ => None,
        }
    }

    /// Get the nested mapping, if this is a [`Value::Map`]
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Get the integer value narrowed to `u16` (ports)
    #[must_use]
    pub fn as_u16(&self) -> Option<u16> {
        self.as_int().and_then(|v| u16::try_from(v).ok())
    }

    /// Get the integer value narrowed to `u32` (flow identifiers)
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        self.as_int().and_then(|v| u32::try_from(v).ok())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let v = Value::Int(42);
        assert_eq!(v.as_int(), Some(42));
        assert!(v.as_str().is_none());
        assert!(v.as_bytes().is_none());

        let v = Value::Str("host".into());
        assert_eq!(v.as_str(), Some("host"));
        assert!(v.as_int().is_none());

        let v = Value::Bytes(Bytes::from_static(b"\x01\x02"));
        assert_eq!(v.as_bytes().map(|b| b.as_ref()), Some(&b"\x01\x02"[..]));

        let v = Value::IntList(vec![2, 2, 30]);
        assert_eq!(v.as_int_list(), Some(&[2, 2, 30][..]));
        assert!(v.as_list().is_none());
    }

    #[test]
    fn test_narrowing() {
        assert_eq!(Value::Int(53).as_u16(), Some(53));
        assert_eq!(Value::Int(65536).as_u16(), None);
        assert_eq!(Value::Int(-1).as_u32(), None);
        assert_eq!(Value::Int(i64::from(u32::MAX)).as_u32(), Some(u32::MAX));
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(7u32), Value::Int(7));
        assert_eq!(Value::from("x"), Value::Str("x".into()));
        assert_eq!(
            Value::from(vec![1i64, 2]),
            Value::IntList(vec![1, 2])
        );
    }
}
