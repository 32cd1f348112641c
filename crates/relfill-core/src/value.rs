//! Dynamic scalar values and primary keys.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator used when a composite primary key is flattened into a map key.
pub const COMPOSITE_KEY_SEPARATOR: &str = "~~~";

/// A dynamically-typed scalar value.
///
/// Entities store their scalar properties as `Value`s and filters compare
/// against them. `Int` and `BigInt` compare equal when they hold the same
/// number, so a key stays one key whichever width a driver hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values (also the shape of a composite key)
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get this value as an i64, widening `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get this value as an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// Try to get this value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Total ordering used for in-memory sorting.
    ///
    /// NULL sorts first, numbers compare numerically across widths, and
    /// values of unrelated types fall back to their type tag.
    pub fn compare(&self, other: &Value) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
            return a.cmp(&b);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.type_tag().cmp(&other.type_tag()),
            },
        }
    }

    /// Stable tag per value family. Integer widths share one tag.
    fn type_tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::BigInt(_) => 2,
            Value::Double(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::Json(_) => 6,
            Value::Array(_) => 7,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
            return a == b;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.type_tag().hash(hasher);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(hasher),
            Value::Int(_) | Value::BigInt(_) => self.as_i64().hash(hasher),
            Value::Double(f) => f.to_bits().hash(hasher),
            Value::Text(s) => s.hash(hasher),
            Value::Bytes(b) => b.hash(hasher),
            Value::Json(j) => j.to_string().hash(hasher),
            Value::Array(items) => {
                items.len().hash(hasher);
                for item in items {
                    item.hash(hasher);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// The primary key of an entity: one value per key property, in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    /// Create a key from its component values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Create a single-column key.
    #[must_use]
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// The component values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Whether this key spans more than one property.
    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }

    /// Whether any component is NULL (an unsaved entity).
    pub fn has_null(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(Value::is_null)
    }

    /// The key as a single filter value: the value itself for simple keys,
    /// an array for composite keys.
    pub fn to_value(&self) -> Value {
        match self.0.as_slice() {
            [single] => single.clone(),
            values => Value::Array(values.to_vec()),
        }
    }

    /// Build a key back from a filter value produced by [`to_value`](Self::to_value).
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(values) => Self(values.clone()),
            other => Self(vec![other.clone()]),
        }
    }

    /// Flatten the key into the string used to key join-table results.
    pub fn serialize(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        parts.join(COMPOSITE_KEY_SEPARATOR)
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        Self::single(v)
    }
}

impl From<i32> for PrimaryKey {
    fn from(v: i32) -> Self {
        Self::single(v)
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        Self::single(v)
    }
}

impl From<String> for PrimaryKey {
    fn from(v: String) -> Self {
        Self::single(v)
    }
}

impl From<Value> for PrimaryKey {
    fn from(v: Value) -> Self {
        Self(vec![v])
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_integer_widths_are_one_key() {
        assert_eq!(Value::Int(42), Value::BigInt(42));
        assert_eq!(hash_of(&Value::Int(42)), hash_of(&Value::BigInt(42)));
        assert_eq!(PrimaryKey::from(7_i32), PrimaryKey::from(7_i64));
    }

    #[test]
    fn test_different_types_differ() {
        assert_ne!(Value::BigInt(42), Value::Text("42".to_string()));
        assert_ne!(
            hash_of(&Value::BigInt(42)),
            hash_of(&Value::Text("42".to_string()))
        );
    }

    #[test]
    fn test_float_hash_uses_bits() {
        let a = Value::Double(1.5);
        let b = Value::Double(1.5);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_compare_orders_numbers_and_nulls() {
        assert_eq!(Value::Int(1).compare(&Value::BigInt(2)), Ordering::Less);
        assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
        assert_eq!(
            Value::from("b").compare(&Value::from("a")),
            Ordering::Greater
        );
        assert_eq!(Value::Double(2.5).compare(&Value::Int(2)), Ordering::Greater);
    }

    #[test]
    fn test_unrelated_types_order_by_family() {
        assert_eq!(Value::Bool(true).compare(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::from("a").compare(&Value::Double(9.0)), Ordering::Greater);
        assert_eq!(
            Value::Bytes(vec![1]).compare(&Value::Array(Vec::new())),
            Ordering::Less
        );
        assert_eq!(Value::Int(3).to_string(), Value::BigInt(3).to_string());
    }

    #[test]
    fn test_primary_key_to_value() {
        assert_eq!(PrimaryKey::from(1_i64).to_value(), Value::BigInt(1));
        let composite = PrimaryKey::new(vec![Value::BigInt(1), Value::from("x")]);
        assert!(composite.is_composite());
        assert_eq!(
            composite.to_value(),
            Value::Array(vec![Value::BigInt(1), Value::from("x")])
        );
        assert_eq!(PrimaryKey::from_value(&composite.to_value()), composite);
    }

    #[test]
    fn test_primary_key_serialize() {
        assert_eq!(PrimaryKey::from(12_i64).serialize(), "12");
        let composite = PrimaryKey::new(vec![Value::BigInt(1), Value::from("en")]);
        assert_eq!(composite.serialize(), "1~~~en");
    }

    #[test]
    fn test_has_null() {
        assert!(PrimaryKey::new(vec![Value::Null]).has_null());
        assert!(PrimaryKey::new(Vec::new()).has_null());
        assert!(!PrimaryKey::from(3_i64).has_null());
    }
}
