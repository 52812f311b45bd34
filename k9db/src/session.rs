//! Client sessions.

use std::sync::Arc;

use parking_lot::RwLock;

use k9db_sqlast::{GdprOperation, GdprStatement, Statement, Value};

use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::error::Result;
use crate::prepared::{self, PreparedStatement};
use crate::shards::sqlengine;
use crate::sql::SqlResult;

/// A single-client execution context. Owns at most one compliance
/// transaction; statements execute sequentially.
pub struct Session {
    state: Arc<RwLock<State>>,
    ctx: ComplianceTransaction,
    prepared: Vec<Arc<PreparedStatement>>,
}

impl Session {
    pub(crate) fn new(state: Arc<RwLock<State>>) -> Session {
        let mut ctx = ComplianceTransaction::new();
        ctx.start();
        Session {
            state,
            ctx,
            prepared: Vec::new(),
        }
    }

    /// Execute one statement. DDL takes the connection's exclusive lock;
    /// everything else runs under the shared lock, inside this session's
    /// compliance transaction.
    pub fn execute(&mut self, statement: &Statement) -> Result<SqlResult> {
        match statement {
            Statement::CreateTable(_)
            | Statement::CreateIndex(_)
            | Statement::CreateView(_)
            | Statement::CreatePolicy(_) => {
                let mut state = self.state.write();
                sqlengine::execute_ddl(statement, &mut state)
            }
            _ => {
                let state = self.state.read();
                sqlengine::execute_dml(statement, &state, &mut self.ctx)
            }
        }
    }

    /// Register a prepared statement; returns its handle.
    pub fn prepare(&mut self, statement: Statement) -> usize {
        let descriptor = self.state.read().canonical_statement(&statement);
        self.prepared.push(descriptor);
        self.prepared.len() - 1
    }

    pub fn execute_prepared(&mut self, handle: usize, args: &[Value]) -> Result<SqlResult> {
        let descriptor = self.prepared[handle].clone();
        let statement = prepared::bind(&descriptor, args)?;
        self.execute(&statement)
    }

    /// Number of orphaned rows this session is tracking for a table.
    pub fn orphans(&self, table_name: &str) -> usize {
        self.ctx.orphan_count(table_name)
    }

    /* GDPR helpers. */

    pub fn gdpr_get(&mut self, shard_kind: &str, user_id: Value) -> Result<SqlResult> {
        self.execute(&Statement::Gdpr(GdprStatement {
            operation: GdprOperation::Get,
            shard_kind: shard_kind.to_string(),
            user_id,
        }))
    }

    pub fn gdpr_forget(&mut self, shard_kind: &str, user_id: Value) -> Result<SqlResult> {
        self.execute(&Statement::Gdpr(GdprStatement {
            operation: GdprOperation::Forget,
            shard_kind: shard_kind.to_string(),
            user_id,
        }))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.ctx.discard();
    }
}
