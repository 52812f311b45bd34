//! UPDATE: in place when ownership is untouched, delete-then-insert when
//! the statement can move rows between shards.

use std::collections::{HashMap, HashSet};

use k9db_sqlast::Update;

use super::util::{Cascader, Condition};
use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::dataflow::record::{Record, UpdateMap};
use crate::error::{Error, Result};
use crate::shards::types::{ShardDescriptor, ShardingInfo};
use crate::sql::rocks::RocksdbSession;
use crate::sql::SqlResult;
use crate::util::ShardName;

const STATEMENT: &str = "UPDATE";

/// One updated row with its shard movement.
struct UpdateInfo {
    old: Record,
    updated: Record,
    old_shards: HashSet<ShardName>,
    new_shards: HashSet<ShardName>,
}

pub struct UpdateContext<'a> {
    stmt: &'a Update,
    table_name: String,
    state: &'a State,
    ctx: &'a mut ComplianceTransaction,
    update_columns: HashSet<usize>,
    positives: Vec<Record>,
    negatives: Vec<Record>,
    count: usize,
}

impl<'a> UpdateContext<'a> {
    pub fn new(stmt: &'a Update, state: &'a State, ctx: &'a mut ComplianceTransaction) -> Self {
        UpdateContext {
            table_name: stmt.table_name.clone(),
            stmt,
            state,
            ctx,
            update_columns: HashSet::new(),
            positives: Vec::new(),
            negatives: Vec::new(),
            count: 0,
        }
    }

    fn invalid(&self, column: Option<&str>, message: impl Into<String>) -> Error {
        Error::invalid(STATEMENT, &self.table_name, column, message)
    }

    fn update_map(&self) -> UpdateMap {
        self.stmt
            .columns
            .iter()
            .cloned()
            .zip(self.stmt.values.iter().cloned())
            .collect()
    }

    /// True when any updated column participates in an owner descriptor,
    /// meaning rows may change shards.
    fn modifies_sharding(&mut self) -> Result<bool> {
        let table = self.state.sharder().table(&self.table_name);
        for column in &self.stmt.columns {
            let Some(index) = table.schema.index_of(column) else {
                return Err(self.invalid(Some(column), "update of a nonexistent column"));
            };
            if table.schema.keys().contains(&index) {
                return Err(self.invalid(Some(column), "updating the primary key is not supported"));
            }
            self.update_columns.insert(index);
        }
        Ok(table
            .owners
            .iter()
            .any(|desc| self.update_columns.contains(&desc.column_index())))
    }

    /// True when a dependent table's placement hangs off an updated column.
    fn modifies_dependents(&self) -> bool {
        self.state
            .sharder()
            .table(&self.table_name)
            .dependents
            .iter()
            .any(|(_, desc)| self.update_columns.contains(&desc.upcolumn_index()))
    }

    /// The shards the updated row belongs in, with integrity checks on
    /// changed foreign keys.
    fn locate_new_shards(
        &self,
        record: &Record,
        session: &RocksdbSession,
    ) -> Result<HashSet<ShardName>> {
        let table = self.state.sharder().table(&self.table_name);
        let mut shards = HashSet::new();
        for desc in &table.owners {
            let value = record.get_value(desc.column_index());
            if value.is_null() {
                continue;
            }
            match &desc.info {
                ShardingInfo::Direct(_) => {
                    if desc.shard_kind != self.table_name
                        && !session.exists_pk(&desc.shard_kind, &value)?
                    {
                        return Err(self
                            .invalid(Some(desc.column()), "foreign key target does not exist"));
                    }
                    shards.insert(ShardName::new(&desc.shard_kind, value.as_unquoted_string()));
                }
                ShardingInfo::Transitive(info) => {
                    if !session.exists_pk(&info.next_table, &value)? {
                        return Err(self
                            .invalid(Some(desc.column()), "foreign key target does not exist"));
                    }
                    for shard in
                        session.find_shards(&info.next_table, info.next_column_index, &value)?
                    {
                        if shard.shard_kind() == desc.shard_kind {
                            shards.insert(shard);
                        }
                    }
                }
                ShardingInfo::Variable(info) => {
                    // The arrow points the other way; the origin rows
                    // decide placement.
                    for shard in session.find_shards(
                        &info.origin_table,
                        info.origin_column_index,
                        &value,
                    )? {
                        if shard.shard_kind() == desc.shard_kind && !shard.is_default() {
                            shards.insert(shard);
                        }
                    }
                }
            }
        }
        if shards.is_empty() {
            shards.insert(ShardName::default_shard());
        }
        Ok(shards)
    }

    /// Slow path: delete the rows, update them in memory, and re-insert
    /// into their recomputed shards.
    fn delete_insert(&mut self, session: &RocksdbSession) -> Result<Vec<UpdateInfo>> {
        tracing::warn!(table = self.table_name.as_str(), "update changes sharding");
        let delete_set = session.execute_delete(&self.stmt.delete_domain())?;
        self.count += delete_set.count();

        // Associate each deduplicated row with its old shards.
        let updates_map = self.update_map();
        let mut updates: Vec<UpdateInfo> = Vec::new();
        let mut by_row: HashMap<usize, usize> = HashMap::new();
        for (shard, position) in delete_set.assignments() {
            let record = delete_set.row(position);
            let entry = by_row.entry(position).or_insert_with(|| {
                updates.push(UpdateInfo {
                    old: record.copy(),
                    updated: record.copy(),
                    old_shards: HashSet::new(),
                    new_shards: HashSet::new(),
                });
                updates.len() - 1
            });
            updates[*entry].old_shards.insert(shard.clone());
        }

        // Apply the update in memory, find new shards, re-insert.
        let pk_column = self.state.sharder().table(&self.table_name).schema.keys()[0];
        for info in &mut updates {
            let mut updated = info.old.update(&updates_map);
            updated.set_positive(true);
            info.new_shards = self.locate_new_shards(&updated, session)?;
            for shard in &info.new_shards {
                session.insert_record(&self.table_name, &updated, shard)?;
                self.count += 1;
            }

            // Orphan bookkeeping for rows entering or leaving the default
            // shard.
            let default_shard = ShardName::default_shard();
            let pk = updated.get_value(pk_column);
            if info.new_shards.contains(&default_shard) {
                self.ctx.add_orphan(&self.table_name, pk);
            } else if info.old_shards.contains(&default_shard) {
                self.ctx.remove_orphan(&self.table_name, &pk);
            }

            info.updated = updated.copy();
            self.positives.push(updated);
        }
        self.negatives = delete_set.into_rows();
        Ok(updates)
    }

    /// Fast path: rows stay put; only values and touched indices change.
    fn direct_update(&mut self, session: &RocksdbSession) -> Result<Vec<UpdateInfo>> {
        let update_set = session.execute_update(self.stmt)?;
        self.count += update_set.count();

        let mut updates: Vec<UpdateInfo> = Vec::new();
        let mut by_pk: HashMap<String, usize> = HashMap::new();
        let pk_column = self.state.sharder().table(&self.table_name).schema.keys()[0];
        for (shard, old, new) in update_set.assignments() {
            let pk = old.get_value(pk_column).as_unquoted_string();
            let entry = by_pk.entry(pk).or_insert_with(|| {
                updates.push(UpdateInfo {
                    old: old.copy(),
                    updated: new.copy(),
                    old_shards: HashSet::new(),
                    new_shards: HashSet::new(),
                });
                updates.len() - 1
            });
            updates[*entry].old_shards.insert(shard.clone());
            updates[*entry].new_shards.insert(shard.clone());
        }

        for record in update_set.into_rows() {
            if record.is_positive() {
                self.positives.push(record);
            } else {
                self.negatives.push(record);
            }
        }
        Ok(updates)
    }

    /// Variable OWNS columns that changed must still point at existing
    /// rows.
    fn validate_owns_targets(
        &self,
        updates: &[UpdateInfo],
        session: &RocksdbSession,
    ) -> Result<()> {
        let table = self.state.sharder().table(&self.table_name);
        for (next_table, desc) in &table.dependents {
            let ShardingInfo::Variable(info) = &desc.info else {
                continue;
            };
            for update in updates {
                let value = update.updated.get_value(info.origin_column_index);
                if update.old.get_value(info.origin_column_index) != value
                    && !value.is_null()
                    && !session.exists_pk(next_table, &value)?
                {
                    return Err(self.invalid(
                        Some(&info.origin_column),
                        "foreign key target does not exist",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Cascade into newly gained shards first, then out of lost ones, so
    /// a dependent row is never transiently orphaned.
    fn cascade_dependents(
        &mut self,
        updates: &[UpdateInfo],
        session: &RocksdbSession,
    ) -> Result<()> {
        let dependents: Vec<(String, ShardDescriptor)> = self
            .state
            .sharder()
            .table(&self.table_name)
            .dependents
            .clone();
        let mut cascader = Cascader::new(self.state);

        // Phase 1: additions.
        for (next_table, desc) in &dependents {
            let kind = desc.shard_kind.as_str();
            for update in updates {
                let added: HashSet<ShardName> = update
                    .new_shards
                    .iter()
                    .filter(|s| {
                        s.shard_kind() == kind && !update.old_shards.contains(*s) && !s.is_default()
                    })
                    .cloned()
                    .collect();
                match &desc.info {
                    ShardingInfo::Direct(_) | ShardingInfo::Transitive(_) => {
                        if added.is_empty() {
                            continue;
                        }
                        let column = desc.upcolumn_index();
                        let condition = Condition {
                            column: desc.column_index(),
                            values: vec![update.updated.get_value(column)],
                        };
                        self.count +=
                            cascader.cascade_to(session, next_table, kind, &added, &condition)?;
                    }
                    ShardingInfo::Variable(info) => {
                        let old_value = update.old.get_value(info.origin_column_index);
                        let new_value = update.updated.get_value(info.origin_column_index);
                        let condition = Condition {
                            column: info.column_index,
                            values: vec![new_value.clone()],
                        };
                        if old_value != new_value {
                            let targets: HashSet<ShardName> = update
                                .new_shards
                                .iter()
                                .filter(|s| s.shard_kind() == kind && !s.is_default())
                                .cloned()
                                .collect();
                            if !targets.is_empty() {
                                self.count += cascader
                                    .cascade_to(session, next_table, kind, &targets, &condition)?;
                            }
                        } else if !added.is_empty() {
                            self.count +=
                                cascader.cascade_to(session, next_table, kind, &added, &condition)?;
                        }
                    }
                }
            }
        }

        // Phase 2: removals.
        for (next_table, desc) in &dependents {
            let kind = desc.shard_kind.as_str();
            for update in updates {
                let removed: HashSet<ShardName> = update
                    .old_shards
                    .iter()
                    .filter(|s| {
                        s.shard_kind() == kind && !update.new_shards.contains(*s) && !s.is_default()
                    })
                    .cloned()
                    .collect();
                match &desc.info {
                    ShardingInfo::Direct(_) | ShardingInfo::Transitive(_) => {
                        if removed.is_empty() {
                            continue;
                        }
                        let column = desc.upcolumn_index();
                        let condition = Condition {
                            column: desc.column_index(),
                            values: vec![update.updated.get_value(column)],
                        };
                        self.count += cascader
                            .cascade_out_all(session, self.ctx, next_table, &removed, &condition)?;
                    }
                    ShardingInfo::Variable(info) => {
                        let old_value = update.old.get_value(info.origin_column_index);
                        let new_value = update.updated.get_value(info.origin_column_index);
                        if old_value != new_value {
                            let condition = Condition {
                                column: info.column_index,
                                values: vec![old_value],
                            };
                            let sources: HashSet<ShardName> = update
                                .old_shards
                                .iter()
                                .filter(|s| s.shard_kind() == kind && !s.is_default())
                                .cloned()
                                .collect();
                            self.count += cascader.cascade_out_all(
                                session, self.ctx, next_table, &sources, &condition,
                            )?;
                        } else if !removed.is_empty() {
                            let condition = Condition {
                                column: info.column_index,
                                values: vec![new_value],
                            };
                            self.count += cascader.cascade_out_all(
                                session, self.ctx, next_table, &removed, &condition,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn exec_within_transaction(&mut self, session: &RocksdbSession) -> Result<()> {
        let modifies_sharding = self.modifies_sharding()?;
        let updates = if modifies_sharding {
            self.delete_insert(session)?
        } else {
            self.direct_update(session)?
        };

        self.validate_owns_targets(&updates, session)?;

        let has_dependents = !self
            .state
            .sharder()
            .table(&self.table_name)
            .dependents
            .is_empty();
        if has_dependents && (modifies_sharding || self.modifies_dependents()) {
            self.cascade_dependents(&updates, session)?;
        }
        Ok(())
    }

    /// In-place nullification used by GDPR FORGET anonymization; runs in
    /// the caller's transaction and returns the dataflow delta.
    pub fn update_anonymize(mut self, session: &RocksdbSession) -> Result<(usize, Vec<Record>)> {
        self.direct_update(session)?;
        let mut records = self.negatives;
        records.extend(self.positives);
        Ok((self.count, records))
    }

    pub fn exec(mut self) -> Result<SqlResult> {
        if !self.state.sharder().table_exists(&self.table_name) {
            return Err(Error::UnknownTable(self.table_name.clone()));
        }

        let mut session = self.state.database().session();
        session.begin_transaction(true);
        self.ctx.add_checkpoint();

        if let Err(error) = self.exec_within_transaction(&session) {
            session.rollback_transaction()?;
            self.ctx.rollback_checkpoint();
            return Err(error);
        }

        if let Err(error) = session.commit_transaction() {
            self.ctx.rollback_checkpoint();
            return Err(error);
        }
        self.ctx.commit_checkpoint();

        let mut records = std::mem::take(&mut self.negatives);
        records.extend(std::mem::take(&mut self.positives));
        self.state.dataflow().process_records(&self.table_name, records);
        Ok(SqlResult::Update(self.count))
    }
}
