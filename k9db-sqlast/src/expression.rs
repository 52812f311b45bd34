//! WHERE and SET expression trees.

use serde::{Deserialize, Serialize};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Eq,
    In,
    Is,
    IsNot,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Plus,
    Minus,
}

/// An expression appearing in a WHERE clause or on the right side of a
/// SET assignment. Arithmetic is limited to `+` and `-` over columns and
/// literals. `Parameter` is a prepared-statement placeholder and must be
/// bound before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expression {
    Column(String),
    Literal(Value),
    LiteralList(Vec<Value>),
    Parameter(usize),
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Expression {
        Expression::Column(name.into())
    }

    pub fn literal(value: impl Into<Value>) -> Expression {
        Expression::Literal(value.into())
    }

    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Expression {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `column = literal`.
    pub fn equality(column: impl Into<String>, value: impl Into<Value>) -> Expression {
        Self::binary(
            BinaryOperator::Eq,
            Self::column(column),
            Self::literal(value),
        )
    }

    /// `column IN (values...)`.
    pub fn within(column: impl Into<String>, values: Vec<Value>) -> Expression {
        Self::binary(
            BinaryOperator::In,
            Self::column(column),
            Expression::LiteralList(values),
        )
    }

    /// Conjoin with AND.
    pub fn and(self, other: Expression) -> Expression {
        Self::binary(BinaryOperator::And, self, other)
    }
}
