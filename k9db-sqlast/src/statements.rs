//! DML, DDL and GDPR statements.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::expression::Expression;
use crate::policy::CreatePolicy;
use crate::schema::CreateTable;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndex {
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateView {
    pub view_name: String,
    pub query: String,
}

/// Single-row insert. Multi-row `VALUES` lists are split into one statement
/// per row before they reach the rewriting engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insert {
    pub table_name: String,
    /// Empty means the statement targets every column in schema order.
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Insert {
    pub fn new(table_name: impl Into<String>) -> Self {
        Insert {
            table_name: table_name.into(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Position of the named column in this statement's value list.
    pub fn value_index(&self, column: &str) -> Option<usize> {
        if self.columns.is_empty() {
            None
        } else {
            self.columns.iter().position(|c| c == column)
        }
    }

    /// Value of the given column; `index` is its position in the schema,
    /// used when the statement is column-less.
    pub fn value_of(&self, column: &str, index: usize) -> Value {
        if self.columns.is_empty() {
            self.values[index].clone()
        } else {
            match self.value_index(column) {
                Some(i) => self.values[i].clone(),
                None => Value::Null,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replace {
    pub table_name: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Replace {
    pub fn into_insert(self) -> Insert {
        Insert {
            table_name: self.table_name,
            columns: self.columns,
            values: self.values,
        }
    }

    pub fn as_insert(&self) -> Insert {
        self.clone().into_insert()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub table_name: String,
    pub columns: Vec<String>,
    pub values: Vec<Expression>,
    pub where_clause: Option<Expression>,
}

impl Update {
    pub fn new(table_name: impl Into<String>) -> Self {
        Update {
            table_name: table_name.into(),
            columns: Vec::new(),
            values: Vec::new(),
            where_clause: None,
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: Expression) -> Self {
        self.columns.push(column.into());
        self.values.push(value);
        self
    }

    pub fn filter(mut self, clause: Expression) -> Self {
        self.where_clause = Some(clause);
        self
    }

    /// The delete statement covering the same rows.
    pub fn delete_domain(&self) -> Delete {
        Delete {
            table_name: self.table_name.clone(),
            where_clause: self.where_clause.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delete {
    pub table_name: String,
    pub where_clause: Option<Expression>,
}

impl Delete {
    pub fn new(table_name: impl Into<String>) -> Self {
        Delete {
            table_name: table_name.into(),
            where_clause: None,
        }
    }

    pub fn filter(mut self, clause: Expression) -> Self {
        self.where_clause = Some(clause);
        self
    }
}

/// One projected output of a SELECT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResultColumn {
    All,
    Column(String),
    Literal(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Select {
    pub table_name: String,
    pub projection: Vec<ResultColumn>,
    pub where_clause: Option<Expression>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Select {
    pub fn new(table_name: impl Into<String>) -> Self {
        Select {
            table_name: table_name.into(),
            projection: vec![ResultColumn::All],
            where_clause: None,
            limit: None,
            offset: 0,
        }
    }

    pub fn project(mut self, projection: Vec<ResultColumn>) -> Self {
        self.projection = projection;
        self
    }

    pub fn filter(mut self, clause: Expression) -> Self {
        self.where_clause = Some(clause);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GdprOperation {
    Get,
    Forget,
}

impl fmt::Display for GdprOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GdprOperation::Get => write!(f, "GET"),
            GdprOperation::Forget => write!(f, "FORGET"),
        }
    }
}

/// `GDPR GET|FORGET <shard kind> <user id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GdprStatement {
    pub operation: GdprOperation,
    pub shard_kind: String,
    pub user_id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainQuery {
    pub query: Box<Statement>,
}

/// Any statement the engine executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Statement {
    CreateTable(CreateTable),
    CreateIndex(CreateIndex),
    CreateView(CreateView),
    CreatePolicy(CreatePolicy),
    Insert(Insert),
    Replace(Replace),
    Update(Update),
    Delete(Delete),
    Select(Select),
    Gdpr(GdprStatement),
    Explain(ExplainQuery),
}

impl Statement {
    /// Statement kind for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::CreateTable(_) => "CREATE TABLE",
            Statement::CreateIndex(_) => "CREATE INDEX",
            Statement::CreateView(_) => "CREATE VIEW",
            Statement::CreatePolicy(_) => "CREATE POLICY",
            Statement::Insert(_) => "INSERT",
            Statement::Replace(_) => "REPLACE",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
            Statement::Select(_) => "SELECT",
            Statement::Gdpr(_) => "GDPR",
            Statement::Explain(_) => "EXPLAIN",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_value_lookup() {
        let mut insert = Insert::new("notes");
        insert.columns = vec!["id".into(), "body".into()];
        insert.values = vec![Value::Int(1), Value::Text("x".into())];
        assert_eq!(insert.value_of("id", 0), Value::Int(1));
        assert_eq!(insert.value_of("author", 2), Value::Null);

        let columnless = Insert {
            table_name: "notes".into(),
            columns: vec![],
            values: vec![Value::Int(1), Value::Text("x".into())],
        };
        assert_eq!(columnless.value_of("body", 1), Value::Text("x".into()));
    }

    #[test]
    fn update_delete_domain() {
        let update = Update::new("notes")
            .set("body", Expression::literal("y"))
            .filter(Expression::equality("id", 1i64));
        let delete = update.delete_domain();
        assert_eq!(delete.table_name, "notes");
        assert!(delete.where_clause.is_some());
    }
}
