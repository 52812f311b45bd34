//! INSERT: route one row into every shard that owns it.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use k9db_sqlast::{Insert, Value};

use super::index;
use super::util::{Cascader, Condition};
use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::dataflow::record::Record;
use crate::error::{Error, Result};
use crate::shards::types::{ShardDescriptor, ShardingInfo};
use crate::sql::rocks::RocksdbSession;
use crate::sql::SqlResult;
use crate::util::ShardName;

const STATEMENT: &str = "INSERT";

pub struct InsertContext<'a> {
    stmt: Insert,
    table_name: String,
    state: &'a State,
    ctx: &'a mut ComplianceTransaction,
    shards: HashSet<ShardName>,
    record: Option<Record>,
    new_users: usize,
}

impl<'a> InsertContext<'a> {
    pub fn new(stmt: Insert, state: &'a State, ctx: &'a mut ComplianceTransaction) -> Self {
        let table_name = stmt.table_name.clone();
        InsertContext {
            stmt,
            table_name,
            state,
            ctx,
            shards: HashSet::new(),
            record: None,
            new_users: 0,
        }
    }

    fn invalid(&self, column: Option<&str>, message: impl Into<String>) -> Error {
        Error::invalid(STATEMENT, &self.table_name, column, message)
    }

    /// Fill in AUTO_INCREMENT and DEFAULT values, normalizing the
    /// statement to one value per schema column.
    fn auto_increment_and_default(&mut self) -> Result<()> {
        let table = self.state.sharder().table(&self.table_name);
        let schema = &table.schema;

        if !self.stmt.has_columns() {
            if self.stmt.values.len() != schema.size() {
                return Err(self.invalid(
                    None,
                    "column-less insert must provide a value for every column",
                ));
            }
            if !table.auto_increments.is_empty() {
                return Err(self.invalid(
                    None,
                    "column-less insert against an AUTO_INCREMENT table",
                ));
            }
            return Ok(());
        }

        for column in &self.stmt.columns {
            if !schema.has_column(column) {
                return Err(self.invalid(Some(column), "insert targets a nonexistent column"));
            }
        }

        let mut values = Vec::with_capacity(schema.size());
        for i in 0..schema.size() {
            let column = schema.name_of(i);
            match self.stmt.value_index(column) {
                Some(position) => values.push(self.stmt.values[position].clone()),
                None => {
                    if table.auto_increments.contains(column) {
                        let counter = table
                            .counter
                            .as_ref()
                            .expect("AUTO_INCREMENT table without counter");
                        values.push(Value::Int(counter.fetch_add(1, Ordering::SeqCst)));
                    } else if let Some(default) = table.defaults.get(column) {
                        values.push(default.clone());
                    } else {
                        return Err(self.invalid(Some(column), "insert leaves a column valueless"));
                    }
                }
            }
        }

        self.stmt.columns.clear();
        self.stmt.values = values;
        Ok(())
    }

    fn direct_insert(
        &mut self,
        value: Value,
        desc: &ShardDescriptor,
        session: &RocksdbSession,
    ) -> Result<()> {
        // The FK must point at an existing, locked row unless this row is
        // its own data subject.
        if desc.shard_kind != self.table_name
            && !session.exists_pk(&desc.shard_kind, &value)?
        {
            return Err(self.invalid(Some(desc.column()), "foreign key target does not exist"));
        }
        self.shards
            .insert(ShardName::new(&desc.shard_kind, value.as_unquoted_string()));
        Ok(())
    }

    fn transitive_insert(
        &mut self,
        value: Value,
        desc: &ShardDescriptor,
        session: &RocksdbSession,
    ) -> Result<()> {
        let ShardingInfo::Transitive(info) = &desc.info else {
            unreachable!()
        };
        if !session.exists_pk(&info.next_table, &value)? {
            return Err(self.invalid(Some(desc.column()), "foreign key target does not exist"));
        }
        let chain = info.index.as_ref().expect("transitive owner without index");
        for user_id in index::lookup(chain, &value, session)? {
            self.shards.insert(ShardName::new(&desc.shard_kind, user_id));
        }
        Ok(())
    }

    /// Insert the row into its shards, enforcing integrity. Does not
    /// commit, cascade or touch the dataflow.
    fn insert_into_base_table(&mut self, session: &RocksdbSession) -> Result<usize> {
        let table = self.state.sharder().table(&self.table_name);
        let schema = table.schema.clone();
        let pk = schema.keys()[0];
        let pk_value = self.stmt.value_of(schema.name_of(pk), pk);

        // PK uniqueness; this locks the pk entry.
        if session.exists_pk(&self.table_name, &pk_value)? {
            return Err(self.invalid(Some(schema.name_of(pk)), "primary key already exists"));
        }

        // Outgoing OWNS columns must point at existing rows.
        for (next_table, desc) in &table.dependents {
            if let ShardingInfo::Variable(info) = &desc.info {
                let value = self
                    .stmt
                    .value_of(&info.origin_column, info.origin_column_index);
                if !value.is_null() && !session.exists_pk(next_table, &value)? {
                    return Err(self.invalid(
                        Some(&info.origin_column),
                        "foreign key target does not exist",
                    ));
                }
            }
        }

        let owners: Vec<ShardDescriptor> = table.owners.clone();
        let sharded = !owners.is_empty();
        for desc in &owners {
            let value = self.stmt.value_of(desc.column(), desc.column_index());
            if value.is_null() {
                continue;
            }
            match &desc.info {
                ShardingInfo::Direct(_) => self.direct_insert(value, desc, session)?,
                ShardingInfo::Transitive(_) => self.transitive_insert(value, desc, session)?,
                // The origin row that would place this row in a shard
                // cannot exist yet, by FK integrity.
                ShardingInfo::Variable(_) => {}
            }
            if desc.shard_kind == self.table_name {
                self.new_users += 1;
            }
        }

        self.record = Some(Record::from_values(
            schema.clone(),
            true,
            self.stmt.values.clone(),
        ));

        if !self.shards.is_empty() {
            let mut count = 0;
            for shard in &self.shards {
                count += session.execute_insert(&self.stmt, shard)?;
            }
            Ok(count)
        } else {
            // No owner found: the row goes to the default shard and, if
            // the table is sharded at all, becomes a tracked orphan.
            let count = session.execute_insert(&self.stmt, &ShardName::default_shard())?;
            if sharded {
                self.ctx.add_orphan(&self.table_name, pk_value);
            }
            Ok(count)
        }
    }

    /// The new row may pull rows of dependent tables into its shards
    /// through variable ownership.
    fn cascade_dependents(&mut self, session: &RocksdbSession) -> Result<usize> {
        let mut count = 0;
        let dependents: Vec<(String, ShardDescriptor)> = self
            .state
            .sharder()
            .table(&self.table_name)
            .dependents
            .clone();
        let mut cascader = Cascader::new(self.state);
        let record = self.record.as_ref().unwrap();
        for (next_table, desc) in dependents {
            let ShardingInfo::Variable(info) = &desc.info else {
                continue;
            };
            let shards: HashSet<ShardName> = self
                .shards
                .iter()
                .filter(|s| s.shard_kind() == desc.shard_kind)
                .cloned()
                .collect();
            if shards.is_empty() {
                continue;
            }
            let condition = Condition {
                column: info.column_index,
                values: vec![record.get_value(info.origin_column_index)],
            };
            count += cascader.cascade_to(session, &next_table, &desc.shard_kind, &shards, &condition)?;
        }
        Ok(count)
    }

    pub fn exec(mut self) -> Result<SqlResult> {
        if !self.state.sharder().table_exists(&self.table_name) {
            return Err(Error::UnknownTable(self.table_name.clone()));
        }
        self.auto_increment_and_default()?;

        let mut session = self.state.database().session();
        session.begin_transaction(true);
        self.ctx.add_checkpoint();

        let result = self
            .insert_into_base_table(&session)
            .and_then(|count| Ok(count + self.cascade_dependents(&session)?));

        let count = match result {
            Ok(count) => count,
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

        let record = self.record.take().unwrap();
        self.state
            .dataflow()
            .process_records(&self.table_name, vec![record]);

        if self.new_users > 0 {
            self.state
                .sharder()
                .increment_users(&self.table_name, self.new_users);
        }
        Ok(SqlResult::Update(count))
    }
}
