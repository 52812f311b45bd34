//! Transitive chain-index lookups.
//!
//! A transitive owner needs "FK value -> owning data subjects". Because
//! every row is physically materialized into all of its owner shards, the
//! parent table's global PK index already knows the answer: the shards of
//! the parent row are exactly the data subjects reachable through the
//! chain. Lookups resolve through the storage indices instead of a
//! planner-built view.

use k9db_sqlast::Value;

use crate::connection::State;
use crate::error::Result;
use crate::shards::types::IndexDescriptor;
use crate::sql::rocks::RocksdbSession;
use crate::util::ShardName;

/// Register a chain index for `table_name.column_name` leading to
/// `shard_kind`.
pub fn create(
    state: &State,
    table_name: &str,
    shard_kind: &str,
    column_name: &str,
    column_index: usize,
) -> IndexDescriptor {
    let suffix = state.sharder().increment_index_count();
    IndexDescriptor {
        index_name: format!("_index_{}", suffix),
        table_name: table_name.to_string(),
        shard_kind: shard_kind.to_string(),
        column_name: column_name.to_string(),
        column_index,
    }
}

/// The user ids of `index.shard_kind` owning the row(s) of
/// `index.table_name` whose indexed column equals `value`.
pub fn lookup(
    index: &IndexDescriptor,
    value: &Value,
    session: &RocksdbSession,
) -> Result<Vec<String>> {
    let shards = session.find_shards(&index.table_name, index.column_index, value)?;
    Ok(shards
        .into_iter()
        .filter(|s: &ShardName| !s.is_default() && s.shard_kind() == index.shard_kind)
        .map(|s| s.user_id().to_string())
        .collect())
}
