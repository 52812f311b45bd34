//! AST-level errors.

use thiserror::Error;

use crate::schema::ColumnType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse \"{0}\" as {1}")]
    Parse(String, ColumnType),

    #[error("\"{0}\" is not a valid datetime")]
    Datetime(String),

    #[error("value {0} is incompatible with column type {1}")]
    Incompatible(String, ColumnType),

    #[error("unknown column \"{0}\"")]
    UnknownColumn(String),
}
