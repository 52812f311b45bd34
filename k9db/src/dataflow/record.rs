//! Schema-bound rows flowing through storage and dataflow.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use k9db_sqlast::{BinaryOperator, ColumnType, Expression, Value};

use super::key::Key;
use super::schema::SchemaRef;
use super::types::ColumnId;
use crate::policy::Policy;

/// Column name to update expression, evaluated against the old row.
pub type UpdateMap = HashMap<String, Expression>;

/// A row bound to a schema, tagged positive (insertion) or negative
/// (retraction), with optional per-column policy tags produced by the
/// compliance layer.
///
/// Copying is explicit through [`Record::copy`]; moves transfer ownership of
/// any heap-allocated strings. Policy tags are metadata, not row identity:
/// equality and hashing ignore them.
#[derive(Debug)]
pub struct Record {
    schema: SchemaRef,
    values: Vec<Value>,
    positive: bool,
    /// Lazily allocated, one slot per column; most rows carry none.
    policies: Option<Box<[Option<Policy>]>>,
}

impl Record {
    /// A record with every column NULL.
    pub fn new(schema: SchemaRef, positive: bool) -> Record {
        let values = vec![Value::Null; schema.size()];
        Record {
            schema,
            values,
            positive,
            policies: None,
        }
    }

    /// Build from a full value list. Panics on arity or type mismatch: the
    /// caller derived both from the same schema.
    pub fn from_values(schema: SchemaRef, positive: bool, values: Vec<Value>) -> Record {
        assert_eq!(values.len(), schema.size(), "record arity mismatch");
        let mut record = Record {
            schema,
            values: Vec::new(),
            positive,
            policies: None,
        };
        record.values = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| record.coerce(i, v))
            .collect();
        record
    }

    /// Coerce a value into the column's type; fatal on incompatibility.
    fn coerce(&self, i: ColumnId, value: Value) -> Value {
        let column_type = self.schema.type_of(i);
        match (&value, column_type) {
            (Value::Null, _) => value,
            (Value::Uint(_), ColumnType::Uint) => value,
            (Value::Int(_), ColumnType::Int) => value,
            (Value::Int(v), ColumnType::Uint) if *v >= 0 => Value::Uint(*v as u64),
            (Value::Uint(v), ColumnType::Int) if *v <= i64::MAX as u64 => Value::Int(*v as i64),
            (Value::Text(_), ColumnType::Text) => value,
            (Value::Datetime(_), ColumnType::Datetime) => value,
            (Value::Text(s), ColumnType::Datetime) => Value::Datetime(s.clone()),
            (Value::Datetime(s), ColumnType::Text) => Value::Text(s.clone()),
            _ => panic!(
                "type mismatch: column {} is {}, got {:?}",
                self.schema.name_of(i),
                column_type,
                value
            ),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn is_positive(&self) -> bool {
        self.positive
    }

    pub fn set_positive(&mut self, positive: bool) {
        self.positive = positive;
    }

    pub fn set_value(&mut self, value: Value, i: ColumnId) {
        self.values[i] = self.coerce(i, value);
    }

    pub fn get_value(&self, i: ColumnId) -> Value {
        self.values[i].clone()
    }

    pub fn value_ref(&self, i: ColumnId) -> &Value {
        &self.values[i]
    }

    pub fn get_uint(&self, i: ColumnId) -> u64 {
        self.values[i].as_uint()
    }

    pub fn get_int(&self, i: ColumnId) -> i64 {
        self.values[i].as_int()
    }

    pub fn is_null(&self, i: ColumnId) -> bool {
        self.values[i].is_null()
    }

    pub fn set_null(&mut self, i: ColumnId) {
        self.values[i] = Value::Null;
    }

    /// Explicit deep copy.
    pub fn copy(&self) -> Record {
        Record {
            schema: self.schema.clone(),
            values: self.values.clone(),
            positive: self.positive,
            policies: self.policies.clone(),
        }
    }

    /// Same row with the positive flag flipped.
    pub fn negate(&self) -> Record {
        let mut copy = self.copy();
        copy.positive = !self.positive;
        copy
    }

    /// Key over the schema's primary key columns.
    pub fn get_key(&self) -> Key {
        self.get_values(self.schema.keys())
    }

    pub fn get_values(&self, columns: &[ColumnId]) -> Key {
        Key::new(columns.iter().map(|c| self.values[*c].clone()).collect())
    }

    /// Deterministic hash over a column subset, used for partitioning.
    pub fn hash_columns(&self, columns: &[ColumnId]) -> u64 {
        let mut hasher = FnvHasher::default();
        for column in columns {
            self.values[*column].hash(&mut hasher);
        }
        hasher.finish()
    }

    /// The full row as a value list.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the record into its value list.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /* Policy tags. */

    pub fn set_policy(&mut self, column: ColumnId, policy: Policy) {
        let slots = self
            .policies
            .get_or_insert_with(|| vec![None; self.schema.size()].into_boxed_slice());
        slots[column] = Some(policy);
    }

    pub fn policy(&self, column: ColumnId) -> Option<&Policy> {
        self.policies
            .as_ref()
            .and_then(|slots| slots[column].as_ref())
    }

    pub fn take_policy(&mut self, column: ColumnId) -> Option<Policy> {
        self.policies
            .as_mut()
            .and_then(|slots| slots[column].take())
    }

    /// Rough heap footprint in bytes.
    pub fn size_in_memory(&self) -> u64 {
        self.values
            .iter()
            .map(|v| match v {
                Value::Text(s) | Value::Datetime(s) => 8 + s.len() as u64,
                _ => 8,
            })
            .sum()
    }

    /// Apply an update map, producing the new row.
    pub fn update(&self, updates: &UpdateMap) -> Record {
        let mut updated = self.copy();
        for (column, expression) in updates {
            let i = self
                .schema
                .index_of(column)
                .unwrap_or_else(|| panic!("update of unknown column {}", column));
            let value = self.evaluate(expression);
            updated.values[i] = match value {
                Value::Null => Value::Null,
                other => updated.coerce(i, other),
            };
        }
        updated
    }

    /// Evaluate a SET expression against this row.
    fn evaluate(&self, expression: &Expression) -> Value {
        match expression {
            Expression::Literal(v) => v.clone(),
            Expression::Column(c) => {
                let i = self
                    .schema
                    .index_of(c)
                    .unwrap_or_else(|| panic!("unknown column {} in expression", c));
                self.values[i].clone()
            }
            Expression::Binary { op, left, right } => {
                let left = self.evaluate(left);
                let right = self.evaluate(right);
                if left.is_null() || right.is_null() {
                    return Value::Null;
                }
                match op {
                    BinaryOperator::Plus => arithmetic(&left, &right, false),
                    BinaryOperator::Minus => arithmetic(&left, &right, true),
                    other => panic!("unsupported operator {:?} in SET expression", other),
                }
            }
            Expression::LiteralList(_) => panic!("literal list in SET expression"),
            Expression::Parameter(i) => panic!("unbound parameter {} in SET expression", i),
        }
    }
}

/// Add or subtract two numeric values. Unsigned minus unsigned promotes to
/// signed; unsigned plus unsigned stays unsigned.
pub(crate) fn arithmetic(left: &Value, right: &Value, minus: bool) -> Value {
    match (left, right) {
        (Value::Uint(l), Value::Uint(r)) => {
            if minus {
                Value::Int(*l as i64 - *r as i64)
            } else {
                Value::Uint(l + r)
            }
        }
        (l, r) => {
            let (l, r) = (l.as_int(), r.as_int());
            Value::Int(if minus { l - r } else { l + r })
        }
    }
}

/// Equality is schema value-equality plus per-column value and null
/// equality. The positive flag is data movement metadata, not row identity.
impl PartialEq for Record {
    fn eq(&self, other: &Record) -> bool {
        self.schema == other.schema && self.values == other.values
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in &self.values {
            value.hash(state);
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|", if self.positive { "+" } else { "-" })?;
        for value in &self.values {
            write!(f, "{}|", value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> SchemaRef {
        SchemaRef::new(
            vec!["id".into(), "count".into(), "name".into()],
            vec![ColumnType::Int, ColumnType::Uint, ColumnType::Text],
            vec![0],
        )
    }

    fn record() -> Record {
        Record::from_values(
            schema(),
            true,
            vec![Value::Int(1), Value::Uint(10), Value::Text("a".into())],
        )
    }

    #[test]
    fn keys_and_hashing() {
        let r = record();
        assert_eq!(r.get_key(), Key::from(Value::Int(1)));
        assert_eq!(r.hash_columns(&[0, 1]), r.copy().hash_columns(&[0, 1]));
        assert_ne!(r.hash_columns(&[0]), r.hash_columns(&[1]));
    }

    #[test]
    fn update_map_arithmetic() {
        let r = record();
        let mut updates = UpdateMap::new();
        updates.insert(
            "count".into(),
            Expression::binary(
                BinaryOperator::Plus,
                Expression::column("count"),
                Expression::literal(5u64),
            ),
        );
        let updated = r.update(&updates);
        assert_eq!(updated.get_uint(1), 15);
        assert_eq!(updated.get_value(0), Value::Int(1));
    }

    #[test]
    fn null_propagates_through_arithmetic() {
        let mut r = record();
        r.set_null(1);
        let mut updates = UpdateMap::new();
        updates.insert(
            "count".into(),
            Expression::binary(
                BinaryOperator::Plus,
                Expression::column("count"),
                Expression::literal(5u64),
            ),
        );
        assert!(r.update(&updates).is_null(1));
    }

    #[test]
    #[should_panic]
    fn type_mismatch_is_fatal() {
        let mut r = record();
        r.set_value(Value::Text("oops".into()), 0);
    }

    #[test]
    fn equality_ignores_sign_of_flag() {
        let a = record();
        let b = a.negate();
        assert_eq!(a, b);
    }
}
