//! K9db: a privacy-compliant relational store.
//!
//! Data is physically partitioned into per-user shards over RocksDB, each
//! encrypted under its owner's key, so a GDPR access or deletion request
//! is a scoped physical operation instead of a cross-table scan. A SQL
//! rewriting engine routes every statement to the right set of shards, and
//! an incremental dataflow engine keeps materialized views consistent with
//! committed writes.

pub mod config;
pub mod connection;
pub mod ctx;
pub mod dataflow;
pub mod error;
pub mod policy;
pub mod prepared;
pub mod session;
pub mod shards;
pub mod sql;
pub mod util;

pub use config::Config;
pub use connection::Connection;
pub use error::{Error, Result};
pub use session::Session;
pub use sql::SqlResult;

/// Open a database, re-executing persisted CREATE statements so the
/// schema and index topology are rebuilt. Persisted CREATE VIEW
/// statements are returned for the caller's planner to compile.
pub fn open(config: &Config) -> Result<(Connection, Vec<k9db_sqlast::CreateView>)> {
    let (connection, statements) = Connection::open(config)?;
    let mut views = Vec::new();
    let mut session = connection.open_session();
    for statement in statements {
        match statement {
            k9db_sqlast::Statement::CreateView(view) => views.push(view),
            other => {
                session.execute(&other)?;
            }
        }
    }
    drop(session);
    Ok((connection, views))
}
