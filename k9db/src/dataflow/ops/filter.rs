//! Filter operator.

use k9db_sqlast::{ColumnType, Value};

use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::dataflow::types::ColumnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    IsNull,
    IsNotNull,
}

/// One condition; conditions are conjoined.
#[derive(Debug, Clone)]
pub enum FilterOperation {
    /// Column against a literal. The literal is never NULL.
    Literal(ColumnId, FilterOp, Value),
    /// Column against another column.
    Column(ColumnId, FilterOp, ColumnId),
    /// IS NULL / IS NOT NULL.
    Null(ColumnId, FilterOp),
}

#[derive(Debug, Clone, Default)]
pub struct FilterOperator {
    operations: Vec<FilterOperation>,
}

impl FilterOperator {
    pub fn new() -> FilterOperator {
        FilterOperator::default()
    }

    pub fn add_literal_operation(&mut self, column: ColumnId, op: FilterOp, value: Value) {
        assert!(!value.is_null(), "use a null operation to test NULL");
        self.operations.push(FilterOperation::Literal(column, op, value));
    }

    pub fn add_column_operation(&mut self, left: ColumnId, op: FilterOp, right: ColumnId) {
        self.operations.push(FilterOperation::Column(left, op, right));
    }

    pub fn add_null_operation(&mut self, column: ColumnId, op: FilterOp) {
        assert!(matches!(op, FilterOp::IsNull | FilterOp::IsNotNull));
        self.operations.push(FilterOperation::Null(column, op));
    }

    pub fn compute_schema(&self, input: &SchemaRef) -> SchemaRef {
        // Validate now so a type mismatch fails at build time, not on the
        // first record.
        for operation in &self.operations {
            match operation {
                FilterOperation::Literal(column, _, value) => {
                    let column_type = input.type_of(*column);
                    if !value.type_compatible(column_type)
                        && !integer_promotable(value, column_type)
                    {
                        panic!(
                            "filter compares column {} ({}) with {:?}",
                            input.name_of(*column),
                            column_type,
                            value
                        );
                    }
                }
                FilterOperation::Column(left, _, right) => {
                    let (l, r) = (input.type_of(*left), input.type_of(*right));
                    let both_integer = matches!(l, ColumnType::Uint | ColumnType::Int)
                        && matches!(r, ColumnType::Uint | ColumnType::Int);
                    if l != r && !both_integer {
                        panic!("filter compares incompatible columns");
                    }
                }
                FilterOperation::Null(..) => {}
            }
        }
        input.clone()
    }

    pub fn process(&self, batch: Vec<Record>) -> Vec<Record> {
        batch.into_iter().filter(|r| self.accept(r)).collect()
    }

    fn accept(&self, record: &Record) -> bool {
        self.operations.iter().all(|operation| match operation {
            FilterOperation::Literal(column, op, value) => {
                if record.is_null(*column) {
                    return false;
                }
                apply(*op, &record.get_value(*column), value)
            }
            FilterOperation::Column(left, op, right) => {
                match (record.is_null(*left), record.is_null(*right)) {
                    (false, false) => {
                        apply(*op, &record.get_value(*left), &record.get_value(*right))
                    }
                    _ => false,
                }
            }
            FilterOperation::Null(column, op) => match op {
                FilterOp::IsNull => record.is_null(*column),
                FilterOp::IsNotNull => !record.is_null(*column),
                _ => unreachable!(),
            },
        })
    }
}

/// A signed literal can stand in for an unsigned column (and vice versa)
/// when the value is representable.
fn integer_promotable(value: &Value, column_type: ColumnType) -> bool {
    matches!(
        (value, column_type),
        (Value::Int(i), ColumnType::Uint) if *i >= 0
    ) || matches!((value, column_type), (Value::Uint(_), ColumnType::Int))
}

fn apply(op: FilterOp, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering::*;
    let ordering = left.sql_cmp(right);
    match op {
        FilterOp::Equal => ordering == Equal,
        FilterOp::NotEqual => ordering != Equal,
        FilterOp::LessThan => ordering == Less,
        FilterOp::LessThanOrEqual => ordering != Greater,
        FilterOp::GreaterThan => ordering == Greater,
        FilterOp::GreaterThanOrEqual => ordering != Less,
        FilterOp::IsNull | FilterOp::IsNotNull => unreachable!(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> SchemaRef {
        SchemaRef::new(
            vec!["id".into(), "age".into(), "name".into()],
            vec![ColumnType::Int, ColumnType::Uint, ColumnType::Text],
            vec![0],
        )
    }

    fn row(id: i64, age: Option<u64>, name: &str) -> Record {
        Record::from_values(
            schema(),
            true,
            vec![
                Value::Int(id),
                age.map(Value::Uint).unwrap_or(Value::Null),
                Value::Text(name.into()),
            ],
        )
    }

    #[test]
    fn conjunction_filters() {
        let mut filter = FilterOperator::new();
        filter.add_literal_operation(1, FilterOp::GreaterThanOrEqual, Value::Uint(18));
        filter.add_literal_operation(2, FilterOp::NotEqual, Value::Text("bob".into()));
        filter.compute_schema(&schema());

        let batch = vec![
            row(1, Some(20), "alice"),
            row(2, Some(20), "bob"),
            row(3, Some(10), "carol"),
            row(4, None, "dave"),
        ];
        let out = filter.process(batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_int(0), 1);
    }

    #[test]
    fn null_checks() {
        let mut filter = FilterOperator::new();
        filter.add_null_operation(1, FilterOp::IsNull);
        let out = filter.process(vec![row(1, None, "a"), row(2, Some(1), "b")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_int(0), 1);
    }

    #[test]
    fn signed_literal_against_unsigned_column() {
        let mut filter = FilterOperator::new();
        filter.add_literal_operation(1, FilterOp::Equal, Value::Int(20));
        filter.compute_schema(&schema());
        let out = filter.process(vec![row(1, Some(20), "a")]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    #[should_panic]
    fn type_mismatch_is_fatal() {
        let mut filter = FilterOperator::new();
        filter.add_literal_operation(2, FilterOp::Equal, Value::Uint(1));
        filter.compute_schema(&schema());
    }

    #[test]
    fn negatives_pass_through() {
        let mut filter = FilterOperator::new();
        filter.add_literal_operation(1, FilterOp::Equal, Value::Uint(20));
        filter.compute_schema(&schema());
        let negative = row(1, Some(20), "a").negate();
        let out = filter.process(vec![negative]);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_positive());
    }
}
