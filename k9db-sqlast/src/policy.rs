//! Policy schemas attached to table columns.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One operand of a policy clause: a literal, or a column of the row the
/// policy is being instantiated for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyExpression {
    Literal(Value),
    Column(String),
}

/// A named policy with its parameter expressions, e.g.
/// `AccessControl(owner_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyClause {
    pub name: String,
    pub expressions: Vec<PolicyExpression>,
}

/// How a schema's clauses compose into one policy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyCombination {
    Single,
    And,
    Or,
}

/// `CREATE POLICY` over one column of a table. Rows read or retracted
/// from the table carry an instance of this schema on that column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePolicy {
    pub table_name: String,
    pub column: String,
    pub combination: PolicyCombination,
    pub clauses: Vec<PolicyClause>,
}
