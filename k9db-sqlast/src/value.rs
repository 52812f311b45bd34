//! Tagged SQL values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;

use crate::error::Error;
use crate::schema::ColumnType;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single SQL value.
///
/// Signed and unsigned integers compare equal when the signed side is
/// non-negative and the magnitudes match. Text and datetime are
/// interchangeable for storage purposes. All other cross-kind comparisons
/// indicate a planner or schema bug and panic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Uint(u64),
    Int(i64),
    Text(String),
    Datetime(String),
}

impl Value {
    /// Parse a SQL literal token into a value of the given column type.
    pub fn from_sql(token: &str, column_type: ColumnType) -> Result<Value, Error> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("NULL") {
            return Ok(Value::Null);
        }
        let unquoted = Self::unquote(token);
        match column_type {
            ColumnType::Uint => token
                .parse::<u64>()
                .map(Value::Uint)
                .map_err(|_| Error::Parse(token.into(), column_type)),
            ColumnType::Int => token
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::Parse(token.into(), column_type)),
            ColumnType::Text => Ok(Value::Text(unquoted.into())),
            ColumnType::Datetime => {
                NaiveDateTime::parse_from_str(unquoted, DATETIME_FORMAT)
                    .map_err(|_| Error::Datetime(unquoted.into()))?;
                Ok(Value::Datetime(unquoted.into()))
            }
        }
    }

    fn unquote(token: &str) -> &str {
        let bytes = token.as_bytes();
        if bytes.len() >= 2 {
            let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
            if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
                return &token[1..token.len() - 1];
            }
        }
        token
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value naturally carries, if any.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Uint(_) => Some(ColumnType::Uint),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Datetime(_) => Some(ColumnType::Datetime),
        }
    }

    /// Whether this value can be stored in a column of the given type.
    pub fn type_compatible(&self, column_type: ColumnType) -> bool {
        match (self, column_type) {
            (Value::Null, _) => true,
            (Value::Uint(_), ColumnType::Uint) => true,
            (Value::Uint(u), ColumnType::Int) => *u <= i64::MAX as u64,
            (Value::Int(_), ColumnType::Int) => true,
            (Value::Int(i), ColumnType::Uint) => *i >= 0,
            (Value::Text(_), ColumnType::Text | ColumnType::Datetime) => true,
            (Value::Datetime(_), ColumnType::Text | ColumnType::Datetime) => true,
            _ => false,
        }
    }

    /// Typed payload access. Tag mismatches are invariant violations.
    pub fn as_uint(&self) -> u64 {
        match self {
            Value::Uint(u) => *u,
            Value::Int(i) if *i >= 0 => *i as u64,
            other => panic!("accessed {:?} as uint", other),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Uint(u) if *u <= i64::MAX as u64 => *u as i64,
            other => panic!("accessed {:?} as int", other),
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Value::Text(s) | Value::Datetime(s) => s,
            other => panic!("accessed {:?} as text", other),
        }
    }

    /// The value as an unquoted string, the form used in shard names and
    /// index entries.
    pub fn as_unquoted_string(&self) -> String {
        match self {
            Value::Null => "NULL".into(),
            Value::Uint(u) => u.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Text(s) | Value::Datetime(s) => s.clone(),
        }
    }

    /// SQL-typed ordering. Comparing incompatible kinds is fatal.
    pub fn sql_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Uint(l), Value::Uint(r)) => l.cmp(r),
            (Value::Int(l), Value::Int(r)) => l.cmp(r),
            (Value::Int(l), Value::Uint(r)) => {
                if *l < 0 {
                    Ordering::Less
                } else {
                    (*l as u64).cmp(r)
                }
            }
            (Value::Uint(l), Value::Int(r)) => {
                if *r < 0 {
                    Ordering::Greater
                } else {
                    l.cmp(&(*r as u64))
                }
            }
            (Value::Text(l) | Value::Datetime(l), Value::Text(r) | Value::Datetime(r)) => l.cmp(r),
            (l, r) => panic!("cannot compare {:?} with {:?}", l, r),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Uint(l), Value::Uint(r)) => l == r,
            (Value::Int(l), Value::Int(r)) => l == r,
            (Value::Int(l), Value::Uint(r)) | (Value::Uint(r), Value::Int(l)) => {
                *l >= 0 && *l as u64 == *r
            }
            (Value::Text(l) | Value::Datetime(l), Value::Text(r) | Value::Datetime(r)) => l == r,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hashing must agree with equality: a non-negative Int hashes like
        // the Uint of the same magnitude, datetime hashes like text.
        match self {
            Value::Null => state.write_u8(0),
            Value::Uint(u) => {
                state.write_u8(1);
                state.write_u64(*u);
            }
            Value::Int(i) if *i >= 0 => {
                state.write_u8(1);
                state.write_u64(*i as u64);
            }
            Value::Int(i) => {
                state.write_u8(2);
                state.write_i64(*i);
            }
            Value::Text(s) | Value::Datetime(s) => {
                state.write_u8(3);
                state.write(s.as_bytes());
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Uint(u) => write!(f, "{}", u),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) | Value::Datetime(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Value {
        Value::Uint(u)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_by_type() {
        assert_eq!(
            Value::from_sql("42", ColumnType::Uint).unwrap(),
            Value::Uint(42)
        );
        assert_eq!(
            Value::from_sql("-42", ColumnType::Int).unwrap(),
            Value::Int(-42)
        );
        assert_eq!(
            Value::from_sql("'hello'", ColumnType::Text).unwrap(),
            Value::Text("hello".into())
        );
        assert_eq!(Value::from_sql("NULL", ColumnType::Int).unwrap(), Value::Null);
        assert!(Value::from_sql("'not a date'", ColumnType::Datetime).is_err());
        assert_eq!(
            Value::from_sql("'2024-05-01 10:30:00'", ColumnType::Datetime).unwrap(),
            Value::Datetime("2024-05-01 10:30:00".into())
        );
    }

    #[test]
    fn signed_unsigned_equality() {
        assert_eq!(Value::Int(5), Value::Uint(5));
        assert_ne!(Value::Int(-5), Value::Uint(5));
        assert_eq!(Value::Int(5).sql_cmp(&Value::Uint(6)), Ordering::Less);
        assert_eq!(Value::Int(-1).sql_cmp(&Value::Uint(0)), Ordering::Less);
    }

    #[test]
    fn hash_agrees_with_equality() {
        use std::collections::hash_map::DefaultHasher;
        let hash = |v: &Value| {
            let mut h = DefaultHasher::new();
            v.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&Value::Int(7)), hash(&Value::Uint(7)));
        assert_eq!(
            hash(&Value::Text("x".into())),
            hash(&Value::Datetime("x".into()))
        );
    }

    #[test]
    fn compatibility() {
        assert!(Value::Int(1).type_compatible(ColumnType::Uint));
        assert!(!Value::Int(-1).type_compatible(ColumnType::Uint));
        assert!(Value::Text("t".into()).type_compatible(ColumnType::Datetime));
        assert!(!Value::Uint(1).type_compatible(ColumnType::Text));
        assert!(Value::Null.type_compatible(ColumnType::Text));
    }
}
