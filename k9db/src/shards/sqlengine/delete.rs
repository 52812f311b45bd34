//! DELETE: remove rows from every shard holding them, keeping referential
//! integrity and cascading variable ownership out.

use std::collections::HashSet;

use k9db_sqlast::Delete;

use super::util::{Cascader, Condition};
use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::dataflow::record::Record;
use crate::error::{Error, Result};
use crate::shards::types::ShardingInfo;
use crate::sql::result::SqlDeleteSet;
use crate::sql::rocks::RocksdbSession;
use crate::sql::SqlResult;

const STATEMENT: &str = "DELETE";

pub struct DeleteContext<'a> {
    stmt: &'a Delete,
    table_name: String,
    state: &'a State,
    ctx: &'a mut ComplianceTransaction,
}

impl<'a> DeleteContext<'a> {
    pub fn new(stmt: &'a Delete, state: &'a State, ctx: &'a mut ComplianceTransaction) -> Self {
        DeleteContext {
            table_name: stmt.table_name.clone(),
            stmt,
            state,
            ctx,
        }
    }

    fn invalid(&self, column: Option<&str>, message: impl Into<String>) -> Error {
        Error::invalid(STATEMENT, &self.table_name, column, message)
    }

    /// No dependent row may still reference a deleted row, either through
    /// an OWNED_BY column or through a variable OWNS column.
    fn check_fk_integrity(
        &self,
        delete_set: &SqlDeleteSet,
        session: &RocksdbSession,
    ) -> Result<()> {
        let table = self.state.sharder().table(&self.table_name);
        for record in delete_set.rows() {
            for (next_table, desc) in &table.dependents {
                if matches!(desc.info, ShardingInfo::Variable(_)) {
                    continue;
                }
                let value = record.get_value(desc.upcolumn_index());
                if session.exists_column(next_table, desc.column_index(), &value)? {
                    return Err(self.invalid(
                        Some(desc.upcolumn()),
                        "rows in a dependent table still reference this row",
                    ));
                }
            }
            for desc in &table.owners {
                let ShardingInfo::Variable(info) = &desc.info else {
                    continue;
                };
                let value = record.get_value(info.column_index);
                if session.exists_column(&info.origin_table, info.origin_column_index, &value)? {
                    return Err(self.invalid(
                        Some(&info.column),
                        "rows in an owning association table still reference this row",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Deleting a row may strip shards from dependent rows it placed there
    /// through variable ownership.
    fn cascade_dependents(
        &mut self,
        delete_set: &SqlDeleteSet,
        session: &RocksdbSession,
    ) -> Result<usize> {
        let dependents = self
            .state
            .sharder()
            .table(&self.table_name)
            .dependents
            .clone();
        let mut cascader = Cascader::new(self.state);
        let mut count = 0;
        for shard in delete_set.shards().cloned().collect::<Vec<_>>() {
            for (next_table, desc) in &dependents {
                if shard.shard_kind() != desc.shard_kind {
                    continue;
                }
                let ShardingInfo::Variable(info) = &desc.info else {
                    continue;
                };
                let condition = Condition {
                    column: info.column_index,
                    values: delete_set
                        .rows_of(&shard)
                        .map(|r| r.get_value(info.origin_column_index))
                        .collect(),
                };
                let mut shards = HashSet::new();
                shards.insert(shard.clone());
                count += cascader.cascade_out_all(
                    session, self.ctx, next_table, &shards, &condition,
                )?;
            }
        }
        Ok(count)
    }

    fn exec_within_transaction(
        &mut self,
        session: &RocksdbSession,
    ) -> Result<(usize, Vec<Record>)> {
        let delete_set = session.execute_delete(self.stmt)?;
        let mut count = delete_set.count();
        self.check_fk_integrity(&delete_set, session)?;
        count += self.cascade_dependents(&delete_set, session)?;
        Ok((count, delete_set.into_rows()))
    }

    /// Row removal on behalf of GDPR FORGET anonymization; runs in the
    /// caller's transaction, skipping integrity checks the forget already
    /// settled.
    pub fn delete_anonymize(self, session: &RocksdbSession) -> Result<(usize, Vec<Record>)> {
        let delete_set = session.execute_delete(self.stmt)?;
        Ok((delete_set.count(), delete_set.into_rows()))
    }

    pub fn exec(mut self) -> Result<SqlResult> {
        if !self.state.sharder().table_exists(&self.table_name) {
            return Err(Error::UnknownTable(self.table_name.clone()));
        }

        let mut session = self.state.database().session();
        session.begin_transaction(true);
        self.ctx.add_checkpoint();

        let (count, records) = match self.exec_within_transaction(&session) {
            Ok(result) => result,
            Err(error) => {
                session.rollback_transaction()?;
                self.ctx.rollback_checkpoint();
                return Err(error);
            }
        };

        if let Err(error) = session.commit_transaction() {
            self.ctx.rollback_checkpoint();
            return Err(error);
        }
        self.ctx.commit_checkpoint();

        // Retracted rows carry their policies into the dataflow.
        let mut records = records;
        crate::policy::make_policies(self.state.policies(), &self.table_name, &mut records);
        self.state.dataflow().process_records(&self.table_name, records);
        Ok(SqlResult::Update(count))
    }
}
