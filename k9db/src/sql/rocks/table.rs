//! Per-table storage over one column family.
//!
//! Data operations are strictly key-indexed. Reads go through a plan that
//! picks the PK index, a unique index, the densest regular index, or a
//! bounded scan; writes keep every index in step before the row itself is
//! touched.

use k9db_sqlast::{Value, ValueMapper};

use super::dedup::DedupSet;
use super::encode::{encode_value, IndexRecord, Sequence};
use super::encryption::{EncryptedKey, EncryptedPrefix, EncryptedValue};
use super::index::{RocksdbIndex, RocksdbPkIndex};
use super::metadata::RocksdbMetadata;
use super::plan::{IndexChoice, Plan};
use super::transaction::{CfRef, Db, Kv};
use crate::dataflow::schema::SchemaRef;
use crate::error::Result;

pub struct RocksdbTable {
    table_name: String,
    schema: SchemaRef,
    pk_column: usize,
    unique_columns: Vec<usize>,
    pk_index: RocksdbPkIndex,
    indices: Vec<RocksdbIndex>,
}

impl RocksdbTable {
    pub fn new(
        db: &Db,
        metadata: &RocksdbMetadata,
        table_name: &str,
        schema: SchemaRef,
    ) -> RocksdbTable {
        metadata.ensure_cf(db, table_name);
        let pk_index = RocksdbPkIndex::new(table_name);
        metadata.ensure_cf(db, pk_index.name());
        RocksdbTable {
            table_name: table_name.to_string(),
            pk_column: schema.keys()[0],
            schema,
            unique_columns: Vec::new(),
            pk_index,
            indices: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn pk_column(&self) -> usize {
        self.pk_column
    }

    pub fn add_unique_column(&mut self, column: usize) {
        self.unique_columns.push(column);
    }

    fn cf<'db>(&self, db: &'db Db) -> CfRef<'db> {
        db.cf_handle(&self.table_name).expect("table family missing")
    }

    /* Index management. */

    /// The column family name an index over these columns would use.
    pub fn index_cf_would_exist(table_name: &str, columns: &[usize]) -> String {
        RocksdbIndex::cf_name_for(table_name, columns)
    }

    /// Create (or reopen) a secondary index over the given columns.
    pub fn create_index(&mut self, db: &Db, metadata: &RocksdbMetadata, columns: Vec<usize>) -> String {
        if let Some(existing) = self.indices.iter().find(|i| i.columns() == columns) {
            return existing.name().to_string();
        }
        let index = RocksdbIndex::new(&self.table_name, columns);
        metadata.ensure_cf(db, index.name());
        let name = index.name().to_string();
        self.indices.push(index);
        name
    }

    pub fn index_descriptions(&self) -> Vec<Vec<usize>> {
        let mut out = vec![vec![self.pk_column]];
        out.extend(self.indices.iter().map(|i| i.columns().to_vec()));
        out
    }

    pub fn index_add(
        &self,
        db: &Db,
        shard: &[u8],
        row: &Sequence,
        kv: &Kv,
        update_pk: bool,
    ) -> Result<()> {
        let pk = row.at(self.pk_column);
        if update_pk {
            self.pk_index.add(db, pk, shard, kv)?;
        }
        for index in &self.indices {
            index.add(db, row, shard, pk, kv)?;
        }
        Ok(())
    }

    pub fn index_delete(
        &self,
        db: &Db,
        shard: &[u8],
        row: &Sequence,
        kv: &Kv,
        update_pk: bool,
    ) -> Result<()> {
        let pk = row.at(self.pk_column);
        if update_pk {
            self.pk_index.delete(db, pk, shard, kv)?;
        }
        for index in &self.indices {
            index.delete(db, row, shard, pk, kv)?;
        }
        Ok(())
    }

    /// Refresh only the indices whose entries actually change between two
    /// versions of a row. The pk and shard are unchanged by construction.
    pub fn index_update(
        &self,
        db: &Db,
        shard: &[u8],
        old: &Sequence,
        new: &Sequence,
        kv: &Kv,
    ) -> Result<()> {
        let pk = old.at(self.pk_column);
        for index in &self.indices {
            if index.touches(old, new) {
                index.delete(db, old, shard, pk, kv)?;
                index.add(db, new, shard, pk, kv)?;
            }
        }
        Ok(())
    }

    /* Planning. */

    pub fn choose_index(&self, mapper: &ValueMapper) -> Plan {
        if mapper.has_values(self.pk_column) {
            return Plan::pk(&self.table_name, &self.schema, vec![self.pk_column]);
        }
        for unique in &self.unique_columns {
            if mapper.has_values(*unique) {
                if let Some(position) =
                    self.indices.iter().position(|i| i.columns() == [*unique])
                {
                    return Plan::index(
                        &self.table_name,
                        &self.schema,
                        true,
                        vec![*unique],
                        position,
                    );
                }
            }
        }
        // Densest regular index: longest fully-constrained column prefix.
        let mut best: Option<(usize, usize)> = None;
        for (position, index) in self.indices.iter().enumerate() {
            let covered = index
                .columns()
                .iter()
                .take_while(|c| mapper.has_values(**c))
                .count();
            if covered > 0 && best.map(|(_, c)| covered > c).unwrap_or(true) {
                best = Some((position, covered));
            }
        }
        match best {
            Some((position, covered)) => Plan::index(
                &self.table_name,
                &self.schema,
                false,
                self.indices[position].columns()[..covered].to_vec(),
                position,
            ),
            None => Plan::scan(&self.table_name, &self.schema),
        }
    }

    pub fn choose_index_for_column(&self, column: usize) -> Plan {
        let mut mapper = ValueMapper::new(self.schema.column_names());
        mapper.add_values(column, vec![Value::Uint(0)]);
        self.choose_index(&mapper)
    }

    /* Index lookups. */

    /// Resolve the WHERE constraints to `(shard, pk)` pairs, or `None` when
    /// only a scan can answer them.
    pub fn index_lookup(
        &self,
        db: &Db,
        mapper: &mut ValueMapper,
        kv: &Kv,
        limit: Option<usize>,
    ) -> Result<Option<Vec<IndexRecord>>> {
        let plan = self.choose_index(mapper);
        match plan.choice() {
            IndexChoice::Pk => {
                let values = mapper.release_values(self.pk_column);
                let encoded: Vec<Vec<u8>> = values.iter().map(encode_value).collect();
                Ok(Some(self.pk_index.get(db, &encoded, kv)?))
            }
            IndexChoice::Unique | IndexChoice::Regular => {
                let index = &self.indices[plan.index_position()];
                let (values, covered) = index.encode_composite(mapper);
                let exact = covered == index.columns().len();
                Ok(Some(index.get(db, values, exact, kv, limit)?))
            }
            IndexChoice::Scan => Ok(None),
        }
    }

    /// Like [`index_lookup`] but deduplicated on pk: a row owned by many
    /// shards resolves to one of them.
    pub fn index_lookup_dedup(
        &self,
        db: &Db,
        mapper: &mut ValueMapper,
        kv: &Kv,
        limit: Option<usize>,
    ) -> Result<Option<Vec<IndexRecord>>> {
        Ok(self.index_lookup(db, mapper, kv, limit)?.map(|records| {
            let mut dedup = DedupSet::new();
            records
                .into_iter()
                .filter(|r| !dedup.duplicate(r.pk().to_vec()))
                .collect()
        }))
    }

    pub fn pk_index(&self) -> &RocksdbPkIndex {
        &self.pk_index
    }

    pub fn index(&self, position: usize) -> &RocksdbIndex {
        &self.indices[position]
    }

    /// Whether any row with this pk exists, locking the pk entry.
    pub fn exists(&self, db: &Db, pk_value: &Value, kv: &Kv) -> Result<bool> {
        self.pk_index.exists(db, &encode_value(pk_value), kv)
    }

    /* Data path. */

    pub fn put(&self, db: &Db, key: &EncryptedKey, value: &EncryptedValue, kv: &Kv) -> Result<()> {
        kv.put(&self.cf(db), key.data(), value.data())
    }

    pub fn delete(&self, db: &Db, key: &EncryptedKey, kv: &Kv) -> Result<()> {
        kv.delete(&self.cf(db), key.data())
    }

    pub fn get(&self, db: &Db, key: &EncryptedKey, kv: &Kv) -> Result<Option<EncryptedValue>> {
        Ok(kv
            .get(&self.cf(db), key.data())?
            .map(EncryptedValue::from_db))
    }

    pub fn multi_get(
        &self,
        db: &Db,
        keys: &[EncryptedKey],
        kv: &Kv,
    ) -> Result<Vec<Option<EncryptedValue>>> {
        let raw: Vec<Vec<u8>> = keys.iter().map(|k| k.data().to_vec()).collect();
        Ok(kv
            .multi_get(&self.cf(db), &raw)?
            .into_iter()
            .map(|v| v.map(EncryptedValue::from_db))
            .collect())
    }

    /// Every row of one shard.
    pub fn get_shard(
        &self,
        db: &Db,
        prefix: &EncryptedPrefix,
        kv: &Kv,
    ) -> Result<Vec<(EncryptedKey, EncryptedValue)>> {
        Ok(kv
            .prefix(&self.cf(db), prefix.data())?
            .into_iter()
            .map(|(k, v)| (EncryptedKey::from_db(k), EncryptedValue::from_db(v)))
            .collect())
    }

    /// Every row of the table. Only GDPR GET and dataflow initialization
    /// walk a whole table.
    pub fn get_all(&self, db: &Db, kv: &Kv) -> Result<Vec<(EncryptedKey, EncryptedValue)>> {
        Ok(kv
            .all(&self.cf(db))?
            .into_iter()
            .map(|(k, v)| (EncryptedKey::from_db(k), EncryptedValue::from_db(v)))
            .collect())
    }
}
