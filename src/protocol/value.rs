//! Typed values carried by a record
//!
//! JSON alone cannot tell a 30-digit integer from a float, or raw bytes from
//! text. These types keep the distinction on the Rust side; the encoder and
//! decoder map them onto the wire convention.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field names starting with this prefix are expected to carry `Binary`.
pub const BINARY_PREFIX: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("empty integer literal")]
    EmptyInteger,

    #[error("invalid integer literal `{0}`")]
    InvalidInteger(String),
}

/// Signed integer of arbitrary magnitude, stored as canonical decimal digits.
///
/// Canonical form: optional `-`, no leading zeros, and zero is never negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Integer(String);

impl Integer {
    /// Parse a decimal literal (`-?[0-9]+`).
    pub fn parse(literal: &str) -> Result<Self, ValueError> {
        let (negative, digits) = match literal.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, literal.strip_prefix('+').unwrap_or(literal)),
        };

        if digits.is_empty() {
            return Err(ValueError::EmptyInteger);
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValueError::InvalidInteger(literal.to_string()));
        }

        let trimmed = digits.trim_start_matches('0');
        let canonical = if trimmed.is_empty() {
            "0".to_string()
        } else if negative {
            format!("-{trimmed}")
        } else {
            trimmed.to_string()
        };

        Ok(Self(canonical))
    }

    /// Decimal digits in canonical form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.starts_with('-')
    }

    /// Value as `i64`, if it fits.
    pub fn to_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl FromStr for Integer {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! integer_from_primitive {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Integer {
                fn from(v: $t) -> Self {
                    Self(v.to_string())
                }
            }
        )*
    };
}

integer_from_primitive!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128);

/// One typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(Integer),
    Real(f64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    /// Short type name, used in diagnostics and the tagged wire format.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "int",
            Value::Real(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }
}

impl From<Integer> for Value {
    fn from(v: Integer) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v.into())
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Field name → value mapping.
///
/// Field order carries no meaning; names are kept sorted so encoded output
/// is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert a field, returning the previous value under that name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.fields.iter()
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

/// Whether a field name follows the binary naming convention.
#[inline]
pub fn is_binary_name(name: &str) -> bool {
    name.starts_with(BINARY_PREFIX)
}
