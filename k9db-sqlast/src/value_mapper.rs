//! WHERE clause constraint extraction.

use std::collections::HashMap;

use crate::expression::{BinaryOperator, Expression};
use crate::value::Value;

/// Maps columns to the set of values the WHERE clause requires of them.
///
/// Only equality and IN constraints are extracted; they drive index
/// selection. Range and null checks stay in the expression and are applied
/// to fetched rows in memory.
#[derive(Debug, Clone)]
pub struct ValueMapper {
    columns: Vec<String>,
    values: HashMap<usize, Vec<Value>>,
}

impl ValueMapper {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        ValueMapper {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            values: HashMap::new(),
        }
    }

    /// Walk a WHERE clause collecting per-column equality and IN values.
    pub fn visit(&mut self, expression: &Expression) {
        if let Expression::Binary { op, left, right } = expression {
            match op {
                BinaryOperator::And => {
                    self.visit(left);
                    self.visit(right);
                }
                BinaryOperator::Eq | BinaryOperator::Is => match (&**left, &**right) {
                    (Expression::Column(c), Expression::Literal(v))
                    | (Expression::Literal(v), Expression::Column(c)) => {
                        if !v.is_null() {
                            self.add_column(c, vec![v.clone()]);
                        }
                    }
                    _ => {}
                },
                BinaryOperator::In => {
                    if let (Expression::Column(c), Expression::LiteralList(vs)) = (&**left, &**right)
                    {
                        self.add_column(c, vs.clone());
                    }
                }
                _ => {}
            }
        }
    }

    fn add_column(&mut self, column: &str, values: Vec<Value>) {
        if let Some(index) = self.columns.iter().position(|c| c == column) {
            self.add_values(index, values);
        }
    }

    pub fn add_values(&mut self, column_index: usize, values: Vec<Value>) {
        self.values.entry(column_index).or_default().extend(values);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn has_values(&self, column_index: usize) -> bool {
        self.values.contains_key(&column_index)
    }

    pub fn values_of(&self, column_index: usize) -> Option<&Vec<Value>> {
        self.values.get(&column_index)
    }

    /// Consume the constraint on a column once a plan has claimed it.
    pub fn release_values(&mut self, column_index: usize) -> Vec<Value> {
        self.values.remove(&column_index).unwrap_or_default()
    }

    /// Columns with at least one constraint.
    pub fn constrained_columns(&self) -> Vec<usize> {
        self.values.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn columns() -> Vec<String> {
        vec!["id".into(), "author".into(), "body".into()]
    }

    #[test]
    fn extracts_equality_and_in() {
        let clause = Expression::equality("id", 7i64)
            .and(Expression::within(
                "author",
                vec![Value::Int(1), Value::Int(2)],
            ))
            .and(Expression::binary(
                BinaryOperator::Gt,
                Expression::column("body"),
                Expression::literal("a"),
            ));

        let mut mapper = ValueMapper::new(&columns());
        mapper.visit(&clause);

        assert_eq!(mapper.values_of(0), Some(&vec![Value::Int(7)]));
        assert_eq!(
            mapper.values_of(1),
            Some(&vec![Value::Int(1), Value::Int(2)])
        );
        // Range constraints are not extracted.
        assert!(!mapper.has_values(2));
    }

    #[test]
    fn release_consumes() {
        let mut mapper = ValueMapper::new(&columns());
        mapper.visit(&Expression::equality("id", 7i64));
        assert!(!mapper.is_empty());
        assert_eq!(mapper.release_values(0), vec![Value::Int(7)]);
        assert!(mapper.is_empty());
    }
}
