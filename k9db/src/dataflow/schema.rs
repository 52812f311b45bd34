//! Schemas: named, typed columns with a primary key set.

use std::fmt;
use std::sync::Arc;

use k9db_sqlast::{ColumnType, CreateTable};

use super::types::ColumnId;

#[derive(Debug, PartialEq, Eq)]
struct SchemaData {
    column_names: Vec<String>,
    column_types: Vec<ColumnType>,
    keys: Vec<ColumnId>,
}

/// A cheaply clonable reference to a schema.
///
/// Schemas compare by value so that equal schemas created independently
/// (e.g. by an operator recomputing its output schema) are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRef(Arc<SchemaData>);

impl SchemaRef {
    pub fn new(
        column_names: Vec<String>,
        column_types: Vec<ColumnType>,
        keys: Vec<ColumnId>,
    ) -> SchemaRef {
        assert_eq!(
            column_names.len(),
            column_types.len(),
            "schema names and types disagree"
        );
        SchemaRef(Arc::new(SchemaData {
            column_names,
            column_types,
            keys,
        }))
    }

    pub fn from_create_table(stmt: &CreateTable) -> SchemaRef {
        let names = stmt.columns.iter().map(|c| c.name.clone()).collect();
        let types = stmt.columns.iter().map(|c| c.column_type).collect();
        let keys = stmt
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key())
            .map(|(i, _)| i)
            .collect();
        SchemaRef::new(names, types, keys)
    }

    pub fn size(&self) -> usize {
        self.0.column_names.len()
    }

    pub fn name_of(&self, column: ColumnId) -> &str {
        &self.0.column_names[column]
    }

    pub fn type_of(&self, column: ColumnId) -> ColumnType {
        self.0.column_types[column]
    }

    pub fn column_names(&self) -> &[String] {
        &self.0.column_names
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.0.column_types
    }

    pub fn keys(&self) -> &[ColumnId] {
        &self.0.keys
    }

    pub fn index_of(&self, name: &str) -> Option<ColumnId> {
        self.0.column_names.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }
}

impl fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, name) in self.0.column_names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", name, self.0.column_types[i])?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::{ColumnConstraint, ColumnDefinition};

    #[test]
    fn from_create_table() {
        let stmt = CreateTable::new("users")
            .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
            .column(ColumnDefinition::new("name", ColumnType::Text));
        let schema = SchemaRef::from_create_table(&stmt);
        assert_eq!(schema.size(), 2);
        assert_eq!(schema.keys(), &[0]);
        assert_eq!(schema.index_of("name"), Some(1));
        assert_eq!(schema.type_of(0), ColumnType::Int);
    }

    #[test]
    fn value_equality() {
        let a = SchemaRef::new(
            vec!["id".into()],
            vec![ColumnType::Int],
            vec![0],
        );
        let b = SchemaRef::new(
            vec!["id".into()],
            vec![ColumnType::Int],
            vec![0],
        );
        assert_eq!(a, b);
    }
}
