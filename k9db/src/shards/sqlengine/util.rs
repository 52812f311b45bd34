//! Ownership cascades shared by insert, update, delete and GDPR FORGET.

use std::collections::{HashMap, HashSet};

use k9db_sqlast::Value;

use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::dataflow::record::Record;
use crate::error::Result;
use crate::shards::types::ShardingInfo;
use crate::sql::rocks::RocksdbSession;
use crate::util::ShardName;

/// A `WHERE column IN values` condition against a dependent table.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: usize,
    pub values: Vec<Value>,
}

/// Propagates shard membership changes down the dependents graph.
///
/// Tracks rows it has already moved to the default shard so a row removed
/// from several shards in one statement is orphaned exactly once.
pub struct Cascader<'a> {
    state: &'a State,
    moved: HashMap<String, HashSet<String>>,
}

impl<'a> Cascader<'a> {
    pub fn new(state: &'a State) -> Cascader<'a> {
        Cascader {
            state,
            moved: HashMap::new(),
        }
    }

    /// Insert the rows matching `condition` into the given shards and
    /// recurse into their dependents. Rows sitting in the default shard
    /// are moved, not copied. Returns the number of physical writes.
    pub fn cascade_to(
        &mut self,
        session: &RocksdbSession,
        table_name: &str,
        shard_kind: &str,
        shards: &HashSet<ShardName>,
        condition: &Condition,
    ) -> Result<usize> {
        let (records, mut count) =
            session.assign_to_shards(table_name, condition.column, &condition.values, shards)?;
        if records.is_empty() {
            return Ok(count);
        }

        let dependents: Vec<_> = self
            .state
            .sharder()
            .table(table_name)
            .dependents
            .iter()
            .filter(|(_, desc)| {
                desc.shard_kind == shard_kind && !matches!(desc.info, ShardingInfo::Direct(_))
            })
            .cloned()
            .collect();
        for (next_table, desc) in dependents {
            let column = desc.upcolumn_index();
            let next_condition = Condition {
                column: desc.column_index(),
                values: records.iter().map(|r| r.get_value(column)).collect(),
            };
            count +=
                self.cascade_to(session, &next_table, shard_kind, shards, &next_condition)?;
        }
        Ok(count)
    }

    /// Remove the rows matching `condition` from one shard, unless the
    /// shard owns them through an unrelated path; rows left with no owner
    /// move to the default shard and are recorded as orphans.
    pub fn cascade_out(
        &mut self,
        session: &RocksdbSession,
        ctx: &mut ComplianceTransaction,
        table_name: &str,
        shard: &ShardName,
        condition: &Condition,
    ) -> Result<usize> {
        // Fetch the matching rows currently in this shard.
        let mut pairs = Vec::new();
        let mut duplicates = HashSet::new();
        for value in &condition.values {
            if duplicates.insert(value.as_unquoted_string()) {
                pairs.push((shard.clone(), value.clone()));
            }
        }
        let records = session.get_direct(table_name, condition.column, &pairs)?;
        if records.is_empty() {
            return Ok(0);
        }

        // A row may be owned by this shard along another path; removing it
        // then would be wrong.
        let legitimate = self.locate_shards(session, table_name, &records)?;
        let pk_column = self.state.sharder().table(table_name).schema.keys()[0];
        let mut remove = Vec::new();
        let mut unowned = Vec::new();
        let mut orphans = Vec::new();
        for (record, legitimate) in records.into_iter().zip(legitimate) {
            if legitimate.contains(shard) {
                continue;
            }
            let mut orphan = false;
            if legitimate.is_empty() {
                let pk = record.get_value(pk_column);
                let moved = self.moved.entry(table_name.to_string()).or_default();
                if moved.insert(pk.as_unquoted_string()) {
                    orphan = true;
                    orphans.push(pk);
                }
            }
            remove.push(record);
            unowned.push(orphan);
        }

        let mut count = session.delete_from_shard(table_name, shard, &remove, &unowned)?;
        ctx.add_orphans(table_name, orphans);

        // Recurse into dependents within the same shard.
        let dependents: Vec<_> = self
            .state
            .sharder()
            .table(table_name)
            .dependents
            .iter()
            .filter(|(_, desc)| {
                desc.shard_kind == shard.shard_kind() && !matches!(desc.info, ShardingInfo::Direct(_))
            })
            .cloned()
            .collect();
        for (next_table, desc) in dependents {
            let column = desc.upcolumn_index();
            let next_condition = Condition {
                column: desc.column_index(),
                values: remove.iter().map(|r| r.get_value(column)).collect(),
            };
            count += self.cascade_out(session, ctx, &next_table, shard, &next_condition)?;
        }
        Ok(count)
    }

    /// [`cascade_out`] over a set of shards.
    pub fn cascade_out_all(
        &mut self,
        session: &RocksdbSession,
        ctx: &mut ComplianceTransaction,
        table_name: &str,
        shards: &HashSet<ShardName>,
        condition: &Condition,
    ) -> Result<usize> {
        let mut count = 0;
        for shard in shards {
            count += self.cascade_out(session, ctx, table_name, shard, condition)?;
        }
        Ok(count)
    }

    /// The shards each record is legitimately owned by, found by walking
    /// every owner path up to its parent.
    pub fn locate_shards(
        &self,
        session: &RocksdbSession,
        table_name: &str,
        records: &[Record],
    ) -> Result<Vec<HashSet<ShardName>>> {
        let mut shards: Vec<HashSet<ShardName>> =
            records.iter().map(|_| HashSet::new()).collect();
        let owners: Vec<_> = self
            .state
            .sharder()
            .table(table_name)
            .owners
            .iter()
            .cloned()
            .collect();
        for desc in owners {
            let column = desc.column_index();
            let parent_column = desc.upcolumn_index();
            let parent_table = desc.next_table().clone();
            for (i, record) in records.iter().enumerate() {
                let value = record.get_value(column);
                if value.is_null() {
                    continue;
                }
                for shard in session.find_shards(&parent_table, parent_column, &value)? {
                    if !shard.is_default() {
                        shards[i].insert(shard);
                    }
                }
            }
        }
        Ok(shards)
    }
}
