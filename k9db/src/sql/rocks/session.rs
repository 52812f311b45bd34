//! Storage session: one client's view of the store.
//!
//! A session owns at most one unit of isolation at a time: a write
//! transaction for DML, or a read snapshot for queries. All row bytes pass
//! through the encryption manager on the way in and out.

use k9db_sqlast::{Delete, Expression, Insert, Select, Update, Value, ValueMapper};

use super::connection::RocksdbConnection;
use super::dedup::DedupSet;
use super::encode::{encode_value, RowRecord, Sequence};
use super::encryption::EncryptedKey;
use super::filter;
use super::project::Projection;
use super::transaction::Kv;
use crate::dataflow::record::{Record, UpdateMap};
use crate::error::Result;
use crate::sql::result::{SqlDeleteSet, SqlResultSet, SqlUpdateSet};
use crate::util::ShardName;

/// One row located in the store, decrypted.
pub(crate) struct LocatedRow {
    pub shard: ShardName,
    pub key: EncryptedKey,
    pub row: Sequence,
    pub record: Record,
}

pub struct RocksdbSession<'c> {
    pub(crate) conn: &'c RocksdbConnection,
    pub(crate) kv: Option<Kv<'c>>,
}

impl<'c> RocksdbSession<'c> {
    pub(crate) fn new(conn: &'c RocksdbConnection) -> RocksdbSession<'c> {
        RocksdbSession { conn, kv: None }
    }

    /* Transaction control. */

    pub fn begin_transaction(&mut self, write: bool) {
        assert!(self.kv.is_none(), "transaction already open");
        self.kv = Some(if write {
            Kv::write(self.conn.db())
        } else {
            Kv::read(self.conn.db())
        });
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        self.kv.take().expect("no open transaction").commit()
    }

    pub fn rollback_transaction(&mut self) -> Result<()> {
        self.kv.take().expect("no open transaction").rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.kv.is_some()
    }

    pub(crate) fn kv(&self) -> &Kv<'c> {
        self.kv.as_ref().expect("no open transaction")
    }

    /* Existence checks. */

    /// Whether a row with the given pk exists, locking the pk entry so a
    /// concurrent insert of the same pk conflicts.
    pub fn exists_pk(&self, table_name: &str, pk: &Value) -> Result<bool> {
        self.conn
            .with_table(table_name, |table| table.exists(self.conn.db(), pk, self.kv()))
    }

    /// Whether any row has `value` in the given column.
    pub fn exists_column(&self, table_name: &str, column: usize, value: &Value) -> Result<bool> {
        let clause = self.column_condition(table_name, column, std::slice::from_ref(value))?;
        let rows = self.locate_rows(table_name, Some(&clause), Some(1), false)?;
        Ok(!rows.is_empty())
    }

    pub(crate) fn column_condition(
        &self,
        table_name: &str,
        column: usize,
        values: &[Value],
    ) -> Result<Expression> {
        let schema = self.conn.table_schema(table_name)?;
        Ok(Expression::within(
            schema.name_of(column),
            values.to_vec(),
        ))
    }

    /* Write path. */

    /// Insert one row into one shard. The statement must already carry a
    /// value for every column (defaults and auto increments applied).
    pub fn execute_insert(&self, stmt: &Insert, shard: &ShardName) -> Result<usize> {
        let schema = self.conn.table_schema(&stmt.table_name)?;
        let values = if stmt.has_columns() {
            (0..schema.size())
                .map(|i| stmt.value_of(schema.name_of(i), i))
                .collect()
        } else {
            stmt.values.clone()
        };
        let record = Record::from_values(schema, true, values);
        self.insert_record(&stmt.table_name, &record, shard)?;
        Ok(1)
    }

    /// Insert an in-memory record into one shard.
    pub fn insert_record(&self, table_name: &str, record: &Record, shard: &ShardName) -> Result<()> {
        self.conn.with_table(table_name, |table| {
            let db = self.conn.db();
            let kv = self.kv();
            let row = RowRecord::from_record(shard, record);
            table.index_add(db, &shard.as_bytes(), &row.value, kv, true)?;
            let encryption = self.conn.encryption();
            let key = encryption.encrypt_key(db, self.conn.metadata(), &row.key);
            let value =
                encryption.encrypt_value(db, self.conn.metadata(), shard.user_id(), &row.value);
            table.put(db, &key, &value, kv)
        })
    }

    /// Replace one row within one shard: drop the shard's copy of the pk
    /// if present, then insert the new row.
    pub fn execute_replace(&self, stmt: &k9db_sqlast::Replace, shard: &ShardName) -> Result<usize> {
        let insert = stmt.as_insert();
        let schema = self.conn.table_schema(&stmt.table_name)?;
        let pk = schema.keys()[0];
        let pk_value = insert.value_of(schema.name_of(pk), pk);

        self.conn.with_table(&stmt.table_name, |table| {
            let db = self.conn.db();
            let kv = self.kv();
            let key = self.row_key(shard, &pk_value);
            if let Some(value) = table.get(db, &key, kv)? {
                let row = self.conn.encryption().decrypt_value(shard.user_id(), &value);
                table.index_delete(db, &shard.as_bytes(), &row, kv, true)?;
                table.delete(db, &key, kv)?;
            }
            Ok(())
        })?;
        self.execute_insert(&insert, shard)
    }

    /// Delete every row matching the statement, across all shards.
    pub fn execute_delete(&self, stmt: &Delete) -> Result<SqlDeleteSet> {
        let rows = self.locate_rows(&stmt.table_name, stmt.where_clause.as_ref(), None, false)?;
        let mut result = SqlDeleteSet::new();
        self.conn.with_table(&stmt.table_name, |table| {
            let db = self.conn.db();
            let kv = self.kv();
            for located in rows {
                table.index_delete(db, &located.shard.as_bytes(), &located.row, kv, true)?;
                table.delete(db, &located.key, kv)?;
                let pk = located.row.at(table.pk_column()).to_vec();
                result.add(pk, located.record, located.shard);
            }
            Ok(())
        })?;
        Ok(result)
    }

    /// In-place update of every matching row. The caller guarantees the
    /// statement does not move rows between shards (no owner column and no
    /// pk is updated), so keys stay put and only changed indices churn.
    pub fn execute_update(&self, stmt: &Update) -> Result<SqlUpdateSet> {
        let mut updates = UpdateMap::new();
        for (column, expression) in stmt.columns.iter().zip(stmt.values.iter()) {
            updates.insert(column.clone(), expression.clone());
        }

        let rows = self.locate_rows(&stmt.table_name, stmt.where_clause.as_ref(), None, false)?;
        let mut result = SqlUpdateSet::new();
        self.conn.with_table(&stmt.table_name, |table| {
            let db = self.conn.db();
            let kv = self.kv();
            let encryption = self.conn.encryption();
            for located in rows {
                let updated = located.record.update(&updates);
                let new_row = Sequence::from_record(&updated);
                table.index_update(db, &located.shard.as_bytes(), &located.row, &new_row, kv)?;
                let value = encryption.encrypt_value(
                    db,
                    self.conn.metadata(),
                    located.shard.user_id(),
                    &new_row,
                );
                table.put(db, &located.key, &value, kv)?;
                let pk = located.row.at(table.pk_column()).to_vec();
                result.add(pk, located.record, updated, located.shard);
            }
            Ok(())
        })?;
        Ok(result)
    }

    /* Read path. */

    pub fn execute_select(&self, stmt: &Select) -> Result<SqlResultSet> {
        let schema = self.conn.table_schema(&stmt.table_name)?;
        let rows = self.locate_rows(&stmt.table_name, stmt.where_clause.as_ref(), None, true)?;
        let projection = Projection::compile(&schema, &stmt.projection);
        let mut records: Vec<Record> = rows
            .into_iter()
            .skip(stmt.offset)
            .take(stmt.limit.unwrap_or(usize::MAX))
            .map(|located| projection.apply(&located.record))
            .collect();
        if projection.is_identity() {
            return Ok(SqlResultSet::new(schema, records));
        }
        let projected = projection.schema().clone();
        records.shrink_to_fit();
        Ok(SqlResultSet::new(projected, records))
    }

    /// Everything in a table, deduplicated by pk.
    pub fn get_all(&self, table_name: &str) -> Result<SqlResultSet> {
        let schema = self.conn.table_schema(table_name)?;
        let rows = self.locate_rows(table_name, None, None, true)?;
        Ok(SqlResultSet::new(
            schema,
            rows.into_iter().map(|l| l.record).collect(),
        ))
    }

    /* Shared lookup machinery. */

    /// Find rows matching a WHERE clause: plan an index, fetch, decrypt,
    /// then apply the full clause as a residual filter. `dedup` collapses
    /// copies of a row shared across shards.
    pub(crate) fn locate_rows(
        &self,
        table_name: &str,
        clause: Option<&Expression>,
        limit: Option<usize>,
        dedup: bool,
    ) -> Result<Vec<LocatedRow>> {
        self.conn.with_table(table_name, |table| {
            let db = self.conn.db();
            let kv = self.kv();
            let encryption = self.conn.encryption();
            let schema = table.schema();

            let mut mapper = ValueMapper::new(schema.column_names());
            if let Some(clause) = clause {
                mapper.visit(clause);
            }

            let mut out = Vec::new();
            let mut dedup_set = DedupSet::new();
            let lookup = table.index_lookup(db, &mut mapper, kv, None)?;
            match lookup {
                Some(index_records) => {
                    let mut keys = Vec::with_capacity(index_records.len());
                    let mut shards = Vec::with_capacity(index_records.len());
                    for index_record in &index_records {
                        let mut sequence = Sequence::new();
                        sequence.append_encoded(index_record.shard());
                        sequence.append_encoded(index_record.pk());
                        keys.push(encryption.encrypt_key(db, self.conn.metadata(), &sequence));
                        shards.push(index_record.shard_name());
                    }
                    let values = table.multi_get(db, &keys, kv)?;
                    for ((key, shard), value) in keys.into_iter().zip(shards).zip(values) {
                        let Some(value) = value else {
                            continue;
                        };
                        let row = encryption.decrypt_value(shard.user_id(), &value);
                        let record = row.decode_record(schema, true);
                        if let Some(clause) = clause {
                            if !filter::matches(clause, &record) {
                                continue;
                            }
                        }
                        if dedup && dedup_set.duplicate(row.at(table.pk_column()).to_vec()) {
                            continue;
                        }
                        out.push(LocatedRow {
                            shard,
                            key,
                            row,
                            record,
                        });
                        if limit.map(|l| out.len() >= l).unwrap_or(false) {
                            break;
                        }
                    }
                }
                None => {
                    for (key, value) in table.get_all(db, kv)? {
                        let shard = encryption.decrypt_shard(&key);
                        let row = encryption.decrypt_value(shard.user_id(), &value);
                        let record = row.decode_record(schema, true);
                        if let Some(clause) = clause {
                            if !filter::matches(clause, &record) {
                                continue;
                            }
                        }
                        if dedup && dedup_set.duplicate(row.at(table.pk_column()).to_vec()) {
                            continue;
                        }
                        out.push(LocatedRow {
                            shard,
                            key,
                            row,
                            record,
                        });
                        if limit.map(|l| out.len() >= l).unwrap_or(false) {
                            break;
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    /// Build the deterministic encrypted key of `(shard, pk value)`.
    pub(crate) fn row_key(&self, shard: &ShardName, pk: &Value) -> EncryptedKey {
        let mut sequence = Sequence::new();
        sequence.append_shard(shard);
        sequence.append_encoded(&encode_value(pk));
        self.conn
            .encryption()
            .encrypt_key(self.conn.db(), self.conn.metadata(), &sequence)
    }
}
