//! REPLACE: update every non-pk column if the pk exists, insert otherwise.

use k9db_sqlast::{Expression, Replace, Update};

use super::insert::InsertContext;
use super::update::UpdateContext;
use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::error::{Error, Result};
use crate::sql::SqlResult;

pub struct ReplaceContext<'a> {
    stmt: &'a Replace,
    state: &'a State,
    ctx: &'a mut ComplianceTransaction,
}

impl<'a> ReplaceContext<'a> {
    pub fn new(stmt: &'a Replace, state: &'a State, ctx: &'a mut ComplianceTransaction) -> Self {
        ReplaceContext { stmt, state, ctx }
    }

    pub fn exec(self) -> Result<SqlResult> {
        let table_name = &self.stmt.table_name;
        if !self.state.sharder().table_exists(table_name) {
            return Err(Error::UnknownTable(table_name.clone()));
        }
        let schema = self.state.sharder().table(table_name).schema.clone();
        let pk = schema.keys()[0];
        let pk_name = schema.name_of(pk);

        let insert = self.stmt.as_insert();
        let pk_value = insert.value_of(pk_name, pk);

        // Peek at the pk under a short-lived transaction; the chosen
        // context re-checks under its own transaction.
        let exists = {
            let mut session = self.state.database().session();
            session.begin_transaction(false);
            let exists = session.exists_pk(table_name, &pk_value);
            session.rollback_transaction()?;
            exists?
        };

        if exists {
            let mut update = Update::new(table_name.clone());
            for i in 0..schema.size() {
                if i == pk {
                    continue;
                }
                let column = schema.name_of(i);
                update = update.set(
                    column,
                    Expression::Literal(insert.value_of(column, i)),
                );
            }
            let update = update.filter(Expression::equality(pk_name, pk_value));
            UpdateContext::new(&update, self.state, self.ctx).exec()
        } else {
            InsertContext::new(insert, self.state, self.ctx).exec()
        }
    }
}
