//! Prepared statements.
//!
//! A prepared statement is a normal typed statement carrying
//! `Expression::Parameter` placeholders (and, for inserts, an empty value
//! list). Statements are cached by their canonical form so every session
//! preparing the same shape shares one descriptor.

use std::sync::Arc;

use k9db_sqlast::{Expression, Statement, Value};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct PreparedStatement {
    pub statement: Statement,
    pub parameters: usize,
}

impl PreparedStatement {
    pub fn new(statement: Statement) -> Arc<PreparedStatement> {
        let parameters = count_parameters(&statement);
        Arc::new(PreparedStatement {
            statement,
            parameters,
        })
    }
}

/// Canonical cache key: the serialized statement shape. Two textual
/// spellings of the same statement canonicalize identically because the
/// parser already normalized them into the AST.
pub fn canonicalize(statement: &Statement) -> String {
    serde_json::to_string(statement).expect("statement is serializable")
}

fn count_in_expression(expression: &Expression, max: &mut usize) {
    match expression {
        Expression::Parameter(i) => *max = (*max).max(i + 1),
        Expression::Binary { left, right, .. } => {
            count_in_expression(left, max);
            count_in_expression(right, max);
        }
        _ => {}
    }
}

fn count_parameters(statement: &Statement) -> usize {
    let mut max = 0;
    match statement {
        Statement::Select(stmt) => {
            if let Some(clause) = &stmt.where_clause {
                count_in_expression(clause, &mut max);
            }
        }
        Statement::Delete(stmt) => {
            if let Some(clause) = &stmt.where_clause {
                count_in_expression(clause, &mut max);
            }
        }
        Statement::Update(stmt) => {
            for value in &stmt.values {
                count_in_expression(value, &mut max);
            }
            if let Some(clause) = &stmt.where_clause {
                count_in_expression(clause, &mut max);
            }
        }
        // An insert template with no values binds one argument per column.
        Statement::Insert(stmt) if stmt.values.is_empty() => {
            max = stmt.columns.len();
        }
        Statement::Replace(stmt) if stmt.values.is_empty() => {
            max = stmt.columns.len();
        }
        _ => {}
    }
    max
}

fn bind_expression(expression: &Expression, args: &[Value]) -> Result<Expression> {
    Ok(match expression {
        Expression::Parameter(i) => {
            let value = args.get(*i).ok_or_else(|| {
                Error::invalid("EXECUTE", "", None, "missing prepared statement argument")
            })?;
            Expression::Literal(value.clone())
        }
        Expression::Binary { op, left, right } => Expression::Binary {
            op: *op,
            left: Box::new(bind_expression(left, args)?),
            right: Box::new(bind_expression(right, args)?),
        },
        other => other.clone(),
    })
}

/// Substitute arguments into a prepared statement's placeholders.
pub fn bind(prepared: &PreparedStatement, args: &[Value]) -> Result<Statement> {
    if args.len() != prepared.parameters {
        return Err(Error::invalid(
            "EXECUTE",
            "",
            None,
            format!(
                "expected {} arguments, got {}",
                prepared.parameters,
                args.len()
            ),
        ));
    }
    Ok(match &prepared.statement {
        Statement::Select(stmt) => {
            let mut bound = stmt.clone();
            bound.where_clause = stmt
                .where_clause
                .as_ref()
                .map(|c| bind_expression(c, args))
                .transpose()?;
            Statement::Select(bound)
        }
        Statement::Delete(stmt) => {
            let mut bound = stmt.clone();
            bound.where_clause = stmt
                .where_clause
                .as_ref()
                .map(|c| bind_expression(c, args))
                .transpose()?;
            Statement::Delete(bound)
        }
        Statement::Update(stmt) => {
            let mut bound = stmt.clone();
            bound.values = stmt
                .values
                .iter()
                .map(|v| bind_expression(v, args))
                .collect::<Result<_>>()?;
            bound.where_clause = stmt
                .where_clause
                .as_ref()
                .map(|c| bind_expression(c, args))
                .transpose()?;
            Statement::Update(bound)
        }
        Statement::Insert(stmt) if stmt.values.is_empty() => {
            let mut bound = stmt.clone();
            bound.values = args.to_vec();
            Statement::Insert(bound)
        }
        Statement::Replace(stmt) if stmt.values.is_empty() => {
            let mut bound = stmt.clone();
            bound.values = args.to_vec();
            Statement::Replace(bound)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::{BinaryOperator, Select};

    #[test]
    fn bind_where_parameters() {
        let select = Select::new("users").filter(Expression::binary(
            BinaryOperator::Eq,
            Expression::column("id"),
            Expression::Parameter(0),
        ));
        let prepared = PreparedStatement::new(Statement::Select(select));
        assert_eq!(prepared.parameters, 1);

        let bound = bind(&prepared, &[Value::Int(7)]).unwrap();
        let Statement::Select(bound) = bound else {
            panic!()
        };
        match bound.where_clause.unwrap() {
            Expression::Binary { right, .. } => {
                assert!(matches!(*right, Expression::Literal(Value::Int(7))));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn bind_insert_values() {
        let mut insert = k9db_sqlast::Insert::new("users");
        insert.columns = vec!["id".into(), "name".into()];
        let prepared = PreparedStatement::new(Statement::Insert(insert));
        assert_eq!(prepared.parameters, 2);
        assert!(bind(&prepared, &[Value::Int(1)]).is_err());

        let bound = bind(&prepared, &[Value::Int(1), Value::Text("a".into())]).unwrap();
        let Statement::Insert(bound) = bound else {
            panic!()
        };
        assert_eq!(bound.values.len(), 2);
    }

    #[test]
    fn canonical_form_is_stable() {
        let a = Statement::Select(Select::new("users"));
        let b = Statement::Select(Select::new("users"));
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }
}
