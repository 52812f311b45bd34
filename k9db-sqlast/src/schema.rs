//! CREATE TABLE statements and per-column constraints.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::Value;

/// Column data types stored by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Uint,
    Int,
    Text,
    Datetime,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Uint => write!(f, "UINT"),
            ColumnType::Int => write!(f, "INT"),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Datetime => write!(f, "DATETIME"),
        }
    }
}

/// How a foreign key participates in ownership.
///
/// `Auto` is a plain `REFERENCES t(c)` that may be promoted to an implicit
/// owner when the target is a data subject. `Plain` (`REFERENCES ONLY`)
/// opts out of that inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignKeyKind {
    Auto,
    Plain,
    OwnedBy,
    Owns,
    AccessedBy,
    Accesses,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnConstraint {
    PrimaryKey,
    Unique,
    NotNull,
    AutoIncrement,
    Default(Value),
    ForeignKey {
        foreign_table: String,
        foreign_column: String,
        kind: ForeignKeyKind,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub constraints: Vec<ColumnConstraint>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnDefinition {
            name: name.into(),
            column_type,
            constraints: Vec::new(),
        }
    }

    pub fn with(mut self, constraint: ColumnConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn has_constraint(&self, wanted: &ColumnConstraint) -> bool {
        self.constraints.iter().any(|c| c == wanted)
    }

    pub fn is_primary_key(&self) -> bool {
        self.has_constraint(&ColumnConstraint::PrimaryKey)
    }

    pub fn is_unique(&self) -> bool {
        self.has_constraint(&ColumnConstraint::Unique) || self.is_primary_key()
    }

    pub fn auto_increment(&self) -> bool {
        self.has_constraint(&ColumnConstraint::AutoIncrement)
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.constraints.iter().find_map(|c| match c {
            ColumnConstraint::Default(v) => Some(v),
            _ => None,
        })
    }

    pub fn foreign_key(&self) -> Option<(&str, &str, ForeignKeyKind)> {
        self.constraints.iter().find_map(|c| match c {
            ColumnConstraint::ForeignKey {
                foreign_table,
                foreign_column,
                kind,
            } => Some((foreign_table.as_str(), foreign_column.as_str(), *kind)),
            _ => None,
        })
    }
}

/// Whether an anonymization rule applies on access or on forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymizationType {
    Get,
    Del,
}

/// `ON GET|DEL <subject column> ANONYMIZE (cols)` or `... DELETE_ROW`.
///
/// An empty `anonymize_columns` list means the whole row is removed (or
/// withheld on GET) when reached along the subject's path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizationRule {
    pub rule_type: AnonymizationType,
    pub data_subject: String,
    pub anonymize_columns: Vec<String>,
}

impl AnonymizationRule {
    pub fn delete_row(&self) -> bool {
        self.anonymize_columns.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTable {
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    pub data_subject: bool,
    pub anonymization_rules: Vec<AnonymizationRule>,
}

impl CreateTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        CreateTable {
            table_name: table_name.into(),
            columns: Vec::new(),
            data_subject: false,
            anonymization_rules: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn data_subject(mut self) -> Self {
        self.data_subject = true;
        self
    }

    pub fn rule(mut self, rule: AnonymizationRule) -> Self {
        self.anonymization_rules.push(rule);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Index of the single primary key column.
    pub fn primary_key(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_primary_key())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder() {
        let stmt = CreateTable::new("users")
            .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
            .column(ColumnDefinition::new("name", ColumnType::Text))
            .data_subject();
        assert!(stmt.data_subject);
        assert_eq!(stmt.primary_key(), Some(0));
        assert_eq!(stmt.column_index("name"), Some(1));
        assert!(stmt.columns[0].is_unique());
    }

    #[test]
    fn foreign_key_lookup() {
        let col = ColumnDefinition::new("author", ColumnType::Int).with(
            ColumnConstraint::ForeignKey {
                foreign_table: "users".into(),
                foreign_column: "id".into(),
                kind: ForeignKeyKind::OwnedBy,
            },
        );
        assert_eq!(col.foreign_key(), Some(("users", "id", ForeignKeyKind::OwnedBy)));
    }
}
