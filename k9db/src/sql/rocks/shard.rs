//! Shard-scoped bulk operations: the physical substrate of GDPR GET and
//! FORGET, and of ownership cascades.

use std::collections::{HashMap, HashSet};

use k9db_sqlast::Value;

use super::dedup::DedupSet;
use super::encode::{encode_value, Sequence};
use super::session::RocksdbSession;
use crate::dataflow::record::Record;
use crate::error::Result;
use crate::sql::result::{KeyPair, SqlResultSet};
use crate::util::ShardName;

impl<'c> RocksdbSession<'c> {
    /// Every row of a table within one shard.
    pub fn get_shard(&self, table_name: &str, shard: &ShardName) -> Result<SqlResultSet> {
        self.conn.with_table(table_name, |table| {
            let db = self.conn.db();
            let encryption = self.conn.encryption();
            let prefix = encryption.encrypt_prefix(shard);
            let mut records = Vec::new();
            for (_, value) in table.get_shard(db, &prefix, self.kv())? {
                let row = encryption.decrypt_value(shard.user_id(), &value);
                records.push(row.decode_record(table.schema(), true));
            }
            Ok(SqlResultSet::new(table.schema().clone(), records))
        })
    }

    /// Delete every row of a table within one shard. Returned records are
    /// negative; whether they are true retractions is for the caller to
    /// decide by counting surviving shard copies.
    pub fn delete_shard(&self, table_name: &str, shard: &ShardName) -> Result<SqlResultSet> {
        self.conn.with_table(table_name, |table| {
            let db = self.conn.db();
            let kv = self.kv();
            let encryption = self.conn.encryption();
            let prefix = encryption.encrypt_prefix(shard);
            let mut records = Vec::new();
            for (key, value) in table.get_shard(db, &prefix, kv)? {
                let row = encryption.decrypt_value(shard.user_id(), &value);
                table.index_delete(db, &shard.as_bytes(), &row, kv, true)?;
                table.delete(db, &key, kv)?;
                records.push(row.decode_record(table.schema(), false));
            }
            Ok(SqlResultSet::new(table.schema().clone(), records))
        })
    }

    /// Point lookups by `(shard, value)` pairs, deduplicated by pk.
    /// `column` may be the pk (direct key construction) or any indexed
    /// column.
    pub fn get_direct(
        &self,
        table_name: &str,
        column: usize,
        keys: &[KeyPair],
    ) -> Result<Vec<Record>> {
        let pk_column = self
            .conn
            .with_table(table_name, |table| Ok(table.pk_column()))?;

        if column == pk_column {
            return self.conn.with_table(table_name, |table| {
                let db = self.conn.db();
                let encryption = self.conn.encryption();
                let encrypted: Vec<_> = keys
                    .iter()
                    .map(|(shard, value)| self.row_key(shard, value))
                    .collect();
                let values = table.multi_get(db, &encrypted, self.kv())?;
                let mut dedup = DedupSet::new();
                let mut out = Vec::new();
                for ((shard, _), value) in keys.iter().zip(values) {
                    let Some(value) = value else { continue };
                    let row = encryption.decrypt_value(shard.user_id(), &value);
                    if dedup.duplicate(row.at(pk_column).to_vec()) {
                        continue;
                    }
                    out.push(row.decode_record(table.schema(), true));
                }
                Ok(out)
            });
        }

        // Arbitrary column: index lookup over the values, then narrow to
        // the requested shard pairs.
        let values: Vec<Value> = keys.iter().map(|(_, v)| v.clone()).collect();
        let clause = self.column_condition(table_name, column, &values)?;
        let rows = self.locate_rows(table_name, Some(&clause), None, false)?;
        let mut dedup = DedupSet::new();
        let mut out = Vec::new();
        for located in rows {
            let wanted = keys.iter().any(|(shard, value)| {
                *shard == located.shard && located.record.get_value(column) == *value
            });
            if !wanted {
                continue;
            }
            let pk = located.record.get_value(located.record.schema().keys()[0]);
            if dedup.duplicate(encode_value(&pk)) {
                continue;
            }
            out.push(located.record);
        }
        Ok(out)
    }

    /// Copy every row whose `column` is in `values` into each target shard
    /// it is missing from; rows that lived in the default shard are moved,
    /// not copied. Returns the affected records (for cascading) and the
    /// number of physical writes.
    pub fn assign_to_shards(
        &self,
        table_name: &str,
        column: usize,
        values: &[Value],
        targets: &HashSet<ShardName>,
    ) -> Result<(Vec<Record>, usize)> {
        assert!(self.kv().is_write(), "assign_to_shards on a read snapshot");
        let clause = self.column_condition(table_name, column, values)?;
        let rows = self.locate_rows(table_name, Some(&clause), None, false)?;
        if rows.is_empty() {
            return Ok((Vec::new(), 0));
        }

        // Group copies of each row.
        struct Grouped {
            record: Record,
            row: Sequence,
            shards: HashSet<ShardName>,
        }
        let mut grouped: HashMap<Vec<u8>, Grouped> = HashMap::new();
        let pk_column = self
            .conn
            .with_table(table_name, |table| Ok(table.pk_column()))?;
        for located in rows {
            let pk = located.row.at(pk_column).to_vec();
            grouped
                .entry(pk)
                .or_insert_with(|| Grouped {
                    record: located.record,
                    row: located.row,
                    shards: HashSet::new(),
                })
                .shards
                .insert(located.shard);
        }

        let default_shard = ShardName::default_shard();
        let mut count = 0;
        let mut affected = Vec::new();
        for (pk, group) in grouped {
            for target in targets {
                if !group.shards.contains(target) {
                    self.insert_record(table_name, &group.record, target)?;
                    count += 1;
                }
            }
            // Owned now; a default-shard copy is stale.
            if group.shards.contains(&default_shard) {
                self.conn.with_table(table_name, |table| {
                    let db = self.conn.db();
                    let kv = self.kv();
                    table.index_delete(db, &default_shard.as_bytes(), &group.row, kv, true)?;
                    let key = self.row_key(
                        &default_shard,
                        &super::encode::decode_value(
                            &pk,
                            table.schema().type_of(pk_column),
                        ),
                    );
                    table.delete(db, &key, kv)
                })?;
                count += 1;
            }
            affected.push(group.record);
        }
        Ok((affected, count))
    }

    /// Remove the given rows from one shard; rows flagged in
    /// `move_to_default` are re-homed to the default shard instead of
    /// vanishing.
    pub fn delete_from_shard(
        &self,
        table_name: &str,
        shard: &ShardName,
        records: &[Record],
        move_to_default: &[bool],
    ) -> Result<usize> {
        assert!(self.kv().is_write(), "delete_from_shard on a read snapshot");
        assert_eq!(records.len(), move_to_default.len());
        let default_shard = ShardName::default_shard();
        let mut count = 0;
        for (record, orphan) in records.iter().zip(move_to_default) {
            self.conn.with_table(table_name, |table| {
                let db = self.conn.db();
                let kv = self.kv();
                let row = Sequence::from_record(record);
                table.index_delete(db, &shard.as_bytes(), &row, kv, true)?;
                let pk = record.get_value(table.pk_column());
                let key = self.row_key(shard, &pk);
                table.delete(db, &key, kv)
            })?;
            count += 1;
            if *orphan {
                self.insert_record(table_name, record, &default_shard)?;
            }
        }
        Ok(count)
    }

    /// How many shards each pk value currently lives in.
    pub fn count_shards(&self, table_name: &str, pk_values: &[Value]) -> Result<Vec<usize>> {
        self.conn.with_table(table_name, |table| {
            let encoded: Vec<Vec<u8>> = pk_values.iter().map(encode_value).collect();
            table
                .pk_index()
                .count_shards(self.conn.db(), &encoded, self.kv())
        })
    }

    /// The set of shards holding any row whose `column` equals `value`.
    pub fn find_shards(
        &self,
        table_name: &str,
        column: usize,
        value: &Value,
    ) -> Result<HashSet<ShardName>> {
        let by_pk = self.conn.with_table(table_name, |table| {
            if column == table.pk_column() {
                let shards = table.pk_index().shards_of(
                    self.conn.db(),
                    &encode_value(value),
                    self.kv(),
                )?;
                Ok(Some(
                    shards
                        .into_iter()
                        .map(|s| ShardName::from_bytes(&s))
                        .collect(),
                ))
            } else {
                Ok(None)
            }
        })?;
        if let Some(shards) = by_pk {
            return Ok(shards);
        }

        let clause = self.column_condition(table_name, column, std::slice::from_ref(value))?;
        let rows = self.locate_rows(table_name, Some(&clause), None, false)?;
        Ok(rows.into_iter().map(|l| l.shard).collect())
    }
}
