//! Engine errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The statement is invalid against the current schema or data. The
    /// transaction was rolled back; the client may fix and retry.
    #[error("{statement}: invalid argument on table \"{table}\"{}: {message}",
            column.as_ref().map(|c| format!(", column \"{}\"", c)).unwrap_or_default())]
    InvalidArgument {
        statement: &'static str,
        table: String,
        column: Option<String>,
        message: String,
    },

    /// A concurrent transaction holds a conflicting lock. Safe to retry.
    #[error("transaction conflict, retry")]
    Busy,

    #[error("table \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("view \"{0}\" does not exist")]
    UnknownView(String),

    #[error("{0}")]
    Ast(#[from] k9db_sqlast::Error),

    #[error("{0}")]
    Rocksdb(rocksdb::Error),

    #[error("{0}")]
    Config(#[from] crate::config::Error),
}

impl Error {
    pub fn invalid(
        statement: &'static str,
        table: impl Into<String>,
        column: Option<&str>,
        message: impl Into<String>,
    ) -> Error {
        Error::InvalidArgument {
            statement,
            table: table.into(),
            column: column.map(|c| c.to_string()),
            message: message.into(),
        }
    }

    /// Whether the client may safely retry the statement.
    pub fn retryable(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(error: rocksdb::Error) -> Error {
        // Lock conflicts and timeouts are the only rocksdb errors a client
        // can do something about.
        match error.kind() {
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain | rocksdb::ErrorKind::TimedOut => {
                Error::Busy
            }
            _ => Error::Rocksdb(error),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
