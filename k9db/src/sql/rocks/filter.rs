//! In-memory WHERE evaluation for fetched rows.
//!
//! Index lookups only consume equality and IN constraints; whatever the
//! WHERE clause also demands (ranges, null checks) is applied here, to
//! decrypted rows.

use std::cmp::Ordering;

use k9db_sqlast::{BinaryOperator, Expression, Value};

use crate::dataflow::record::Record;

/// Whether the record satisfies the clause.
pub fn matches(clause: &Expression, record: &Record) -> bool {
    match clause {
        Expression::Binary { op, left, right } => match op {
            BinaryOperator::And => matches(left, record) && matches(right, record),
            BinaryOperator::Eq => compare(left, right, record, |o| o == Ordering::Equal),
            BinaryOperator::Lt => compare(left, right, record, |o| o == Ordering::Less),
            BinaryOperator::LtEq => compare(left, right, record, |o| o != Ordering::Greater),
            BinaryOperator::Gt => compare(left, right, record, |o| o == Ordering::Greater),
            BinaryOperator::GtEq => compare(left, right, record, |o| o != Ordering::Less),
            BinaryOperator::Is => is_null_check(left, right, record, true),
            BinaryOperator::IsNot => is_null_check(left, right, record, false),
            BinaryOperator::In => {
                let value = operand(left, record);
                match &**right {
                    Expression::LiteralList(values) => {
                        value.map(|v| values.contains(&v)).unwrap_or(false)
                    }
                    _ => panic!("IN without literal list"),
                }
            }
            BinaryOperator::Plus | BinaryOperator::Minus => {
                panic!("arithmetic is not a filter")
            }
        },
        _ => panic!("filter clause must be a binary expression"),
    }
}

/// Resolve an operand to a value; `None` means SQL NULL.
fn operand(expression: &Expression, record: &Record) -> Option<Value> {
    let value = match expression {
        Expression::Column(name) => {
            let i = record
                .schema()
                .index_of(name)
                .unwrap_or_else(|| panic!("unknown column {} in filter", name));
            record.get_value(i)
        }
        Expression::Literal(value) => value.clone(),
        _ => panic!("unsupported filter operand"),
    };
    match value {
        Value::Null => None,
        other => Some(other),
    }
}

fn compare(
    left: &Expression,
    right: &Expression,
    record: &Record,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    match (operand(left, record), operand(right, record)) {
        // NULL compares with nothing.
        (Some(l), Some(r)) => accept(l.sql_cmp(&r)),
        _ => false,
    }
}

fn is_null_check(left: &Expression, right: &Expression, record: &Record, positive: bool) -> bool {
    let is_null = match right {
        Expression::Literal(Value::Null) => operand(left, record).is_none(),
        _ => match (operand(left, record), operand(right, record)) {
            (Some(l), Some(r)) => return positive == (l == r),
            (None, None) => true,
            _ => false,
        },
    };
    positive == is_null
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataflow::schema::SchemaRef;
    use k9db_sqlast::ColumnType;

    fn record() -> Record {
        let schema = SchemaRef::new(
            vec!["id".into(), "age".into(), "name".into()],
            vec![ColumnType::Int, ColumnType::Uint, ColumnType::Text],
            vec![0],
        );
        Record::from_values(
            schema,
            true,
            vec![Value::Int(3), Value::Uint(20), Value::Null],
        )
    }

    #[test]
    fn ranges_and_nulls() {
        let r = record();
        assert!(matches(
            &Expression::binary(
                BinaryOperator::GtEq,
                Expression::column("age"),
                Expression::literal(20u64),
            ),
            &r
        ));
        assert!(!matches(
            &Expression::binary(
                BinaryOperator::Lt,
                Expression::column("age"),
                Expression::literal(20u64),
            ),
            &r
        ));
        assert!(matches(
            &Expression::binary(
                BinaryOperator::Is,
                Expression::column("name"),
                Expression::literal(Value::Null),
            ),
            &r
        ));
        assert!(!matches(
            &Expression::binary(
                BinaryOperator::IsNot,
                Expression::column("name"),
                Expression::literal(Value::Null),
            ),
            &r
        ));
    }

    #[test]
    fn signed_unsigned_comparison() {
        let r = record();
        // A signed literal against an unsigned column promotes safely.
        assert!(matches(&Expression::equality("age", 20i64), &r));
    }

    #[test]
    fn conjunction() {
        let r = record();
        let clause = Expression::equality("id", 3i64).and(Expression::within(
            "age",
            vec![Value::Uint(19), Value::Uint(20)],
        ));
        assert!(matches(&clause, &r));
    }
}
