//! The SQL rewriting engine.
//!
//! Each statement kind has a context with a single `exec` entry point that
//! turns the logical statement into shard-targeted storage operations,
//! enforces integrity, cascades ownership changes, and feeds the resulting
//! positive/negative batches to the dataflow engine. DDL runs under the
//! connection's exclusive lock; everything else under the shared lock.

pub mod create;
pub mod delete;
pub mod explain;
pub mod gdpr;
pub mod index;
pub mod insert;
pub mod replace;
pub mod select;
pub mod update;
pub mod util;

use k9db_sqlast::{GdprOperation, PolicyExpression, Statement};

use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::error::{Error, Result};
use crate::policy;
use crate::sql::SqlResult;

/// Execute a schema-changing statement.
pub fn execute_ddl(statement: &Statement, state: &mut State) -> Result<SqlResult> {
    match statement {
        Statement::CreateTable(stmt) => create::CreateContext::new(stmt, state).exec(),
        Statement::CreateIndex(stmt) => {
            state.database().execute_create_index(stmt)?;
            Ok(SqlResult::Statement(true))
        }
        Statement::CreateView(stmt) => {
            // The planner compiles the view; the engine persists it so a
            // reopened database can hand it back for re-planning.
            state.database().persist_create_view(stmt)?;
            Ok(SqlResult::Statement(true))
        }
        Statement::CreatePolicy(stmt) => {
            if !state.sharder().table_exists(&stmt.table_name) {
                return Err(Error::UnknownTable(stmt.table_name.clone()));
            }
            let schema = state.sharder().table(&stmt.table_name).schema.clone();
            let mut named = vec![stmt.column.as_str()];
            named.extend(stmt.clauses.iter().flat_map(|clause| {
                clause.expressions.iter().filter_map(|e| match e {
                    PolicyExpression::Column(column) => Some(column.as_str()),
                    PolicyExpression::Literal(_) => None,
                })
            }));
            for column in named {
                if !schema.has_column(column) {
                    return Err(Error::invalid(
                        "CREATE POLICY",
                        &stmt.table_name,
                        Some(column),
                        "unknown column",
                    ));
                }
            }
            state.database().persist_create_policy(stmt)?;
            state.policies_mut().add(stmt.clone());
            Ok(SqlResult::Statement(true))
        }
        _ => panic!("{} is not DDL", statement.kind()),
    }
}

/// Execute a data statement within the session's compliance transaction.
pub fn execute_dml(
    statement: &Statement,
    state: &State,
    ctx: &mut ComplianceTransaction,
) -> Result<SqlResult> {
    match statement {
        Statement::Insert(stmt) => insert::InsertContext::new(stmt.clone(), state, ctx).exec(),
        Statement::Replace(stmt) => replace::ReplaceContext::new(stmt, state, ctx).exec(),
        Statement::Update(stmt) => update::UpdateContext::new(stmt, state, ctx).exec(),
        Statement::Delete(stmt) => delete::DeleteContext::new(stmt, state, ctx).exec(),
        Statement::Select(stmt) => {
            let result = if state.dataflow().has_flow(&stmt.table_name) {
                select::select_view(stmt, state)?
            } else {
                let result = select::SelectContext::new(stmt, state).exec()?;
                attach_policies(&stmt.table_name, state, result)
            };
            Ok(serialize_policies(result))
        }
        Statement::Gdpr(stmt) => match stmt.operation {
            GdprOperation::Get => {
                // GET attaches policies per table as it collects records.
                let result = gdpr::GdprGetContext::new(stmt, state).exec()?;
                Ok(serialize_policies(result))
            }
            GdprOperation::Forget => gdpr::GdprForgetContext::new(stmt, state, ctx).exec(),
        },
        Statement::Explain(stmt) => explain::ExplainContext::new(state).exec(&stmt.query),
        other => Err(Error::invalid(
            other.kind(),
            "",
            None,
            "statement requires the exclusive lock",
        )),
    }
}

/// Tag the rows of a table read with their policy instances.
fn attach_policies(table_name: &str, state: &State, result: SqlResult) -> SqlResult {
    if !state.policies().has_policies(table_name) {
        return result;
    }
    match result {
        SqlResult::ResultSets(mut sets) => {
            for set in &mut sets {
                policy::make_policies(state.policies(), table_name, set.rows_mut());
            }
            SqlResult::ResultSets(sets)
        }
        other => other,
    }
}

/// Serialize any policy tags into the result so the client sees them.
fn serialize_policies(result: SqlResult) -> SqlResult {
    match result {
        SqlResult::ResultSets(sets) => {
            SqlResult::ResultSets(policy::serialize_policies(sets))
        }
        other => other,
    }
}
