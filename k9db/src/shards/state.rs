//! Sharder state: all tables, shard kinds and their relationships.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::types::{Shard, ShardDescriptor, ShardKind, Table, TableName};

/// The authoritative ownership graph. Mutated only while the connection's
/// exclusive lock is held (DDL); user counts and the index-name counter are
/// interior so DML can touch them under the shared lock.
#[derive(Default)]
pub struct SharderState {
    /// Tables in creation order; iteration order matters for reopen.
    tables: IndexMap<TableName, Table>,
    shards: HashMap<ShardKind, Shard>,
    /// Live users per shard kind.
    users: Mutex<HashMap<ShardKind, usize>>,
    index_counter: AtomicU64,
}

impl SharderState {
    pub fn new() -> SharderState {
        SharderState::default()
    }

    pub fn table_exists(&self, table_name: &str) -> bool {
        self.tables.contains_key(table_name)
    }

    pub fn table(&self, table_name: &str) -> &Table {
        self.tables
            .get(table_name)
            .unwrap_or_else(|| panic!("sharder has no table {}", table_name))
    }

    pub fn table_mut(&mut self, table_name: &str) -> &mut Table {
        self.tables
            .get_mut(table_name)
            .unwrap_or_else(|| panic!("sharder has no table {}", table_name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn add_table(&mut self, table: Table) -> &Table {
        let name = table.table_name.clone();
        self.tables.insert(name.clone(), table);
        &self.tables[&name]
    }

    /// Whether the table is stored in shards (reachable by ownership).
    pub fn is_owned(&self, table_name: &str) -> bool {
        self.tables
            .get(table_name)
            .map(|t| t.is_sharded())
            .unwrap_or(false)
    }

    /// Whether the table is reachable by ownership or accessorship.
    pub fn is_accessed(&self, table_name: &str) -> bool {
        self.tables
            .get(table_name)
            .map(|t| !t.accessors.is_empty() || t.is_sharded())
            .unwrap_or(false)
    }

    /* Shard kinds. */

    pub fn add_shard_kind(&mut self, shard_kind: &str, id_column: &str, id_column_index: usize) {
        self.shards.insert(
            shard_kind.to_string(),
            Shard {
                shard_kind: shard_kind.to_string(),
                id_column: id_column.to_string(),
                id_column_index,
                owned_tables: Default::default(),
                accessor_tables: Default::default(),
            },
        );
    }

    pub fn shard_kind_exists(&self, shard_kind: &str) -> bool {
        self.shards.contains_key(shard_kind)
    }

    pub fn shard(&self, shard_kind: &str) -> &Shard {
        self.shards
            .get(shard_kind)
            .unwrap_or_else(|| panic!("unknown shard kind {}", shard_kind))
    }

    pub fn add_owned_table(&mut self, shard_kind: &str, table_name: &str) {
        self.shards
            .get_mut(shard_kind)
            .unwrap_or_else(|| panic!("unknown shard kind {}", shard_kind))
            .owned_tables
            .insert(table_name.to_string());
    }

    pub fn add_accessor_table(&mut self, shard_kind: &str, table_name: &str) {
        self.shards
            .get_mut(shard_kind)
            .unwrap_or_else(|| panic!("unknown shard kind {}", shard_kind))
            .accessor_tables
            .insert(table_name.to_string());
    }

    /* Graph edges added after table creation (OWNS/ACCESSES). */

    /// Register new ways of owning `table_name` and mirror the dependency
    /// edges onto the parent tables. A data subject's self-descriptor gets
    /// no dependency edge: cascades never loop a table onto itself.
    pub fn add_table_owners(&mut self, table_name: &str, descriptors: Vec<ShardDescriptor>) {
        for descriptor in descriptors {
            let parent = descriptor.next_table().clone();
            if parent != table_name {
                self.table_mut(&parent)
                    .dependents
                    .push((table_name.to_string(), descriptor.clone()));
            }
            self.add_owned_table(&descriptor.shard_kind.clone(), table_name);
            self.table_mut(table_name).owners.push(descriptor);
        }
    }

    pub fn add_table_accessors(&mut self, table_name: &str, descriptors: Vec<ShardDescriptor>) {
        for descriptor in descriptors {
            let parent = descriptor.next_table().clone();
            if parent != table_name {
                self.table_mut(&parent)
                    .access_dependents
                    .push((table_name.to_string(), descriptor.clone()));
            }
            self.add_accessor_table(&descriptor.shard_kind.clone(), table_name);
            self.table_mut(table_name).accessors.push(descriptor);
        }
    }

    /* Per-kind user counts. */

    pub fn increment_users(&self, shard_kind: &str, count: usize) {
        *self.users.lock().entry(shard_kind.to_string()).or_insert(0) += count;
    }

    pub fn decrement_users(&self, shard_kind: &str, count: usize) {
        let mut users = self.users.lock();
        let entry = users.entry(shard_kind.to_string()).or_insert(0);
        *entry = entry.saturating_sub(count);
    }

    pub fn num_shards(&self) -> HashMap<ShardKind, usize> {
        self.users.lock().clone()
    }

    /// Unique suffix for generated chain-index names.
    pub fn increment_index_count(&self) -> u64 {
        self.index_counter.fetch_add(1, Ordering::Relaxed)
    }
}
