//! Persistent indices over table column families.
//!
//! The PK index maps an encoded primary key to the list of shards holding
//! its row; secondary indices store `value ⨾ shard ⨾ pk` entries with empty
//! cell values. Both live in their own column families so they persist and
//! reopen lazily. Index entries are plaintext: they hold logical values and
//! shard names, never row payloads.

use k9db_sqlast::ValueMapper;

use super::encode::{encode_value, IndexEntry, IndexRecord, PkIndexValue, Sequence};
use super::transaction::{CfRef, Db, Kv};
use crate::dataflow::schema::SchemaRef;
use crate::error::Result;

pub const PK_INDEX_SUFFIX: &str = "__pk_index";
pub const INDEX_SUFFIX: &str = "__index";

/// A secondary index over one or more columns.
#[derive(Debug, Clone)]
pub struct RocksdbIndex {
    cf_name: String,
    columns: Vec<usize>,
}

impl RocksdbIndex {
    /// Derive the column family name for an index over the given columns.
    pub fn cf_name_for(table_name: &str, columns: &[usize]) -> String {
        let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        format!("{}_{}{}", table_name, cols.join("_"), INDEX_SUFFIX)
    }

    pub fn new(table_name: &str, columns: Vec<usize>) -> RocksdbIndex {
        RocksdbIndex {
            cf_name: Self::cf_name_for(table_name, &columns),
            columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.cf_name
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn cf<'db>(&self, db: &'db Db) -> CfRef<'db> {
        db.cf_handle(&self.cf_name).expect("index family missing")
    }

    fn entry(&self, row: &Sequence, shard: &[u8], pk: &[u8]) -> IndexEntry {
        let values: Vec<&[u8]> = self.columns.iter().map(|c| row.at(*c)).collect();
        IndexEntry::new(&values, shard, pk)
    }

    pub fn add(&self, db: &Db, row: &Sequence, shard: &[u8], pk: &[u8], kv: &Kv) -> Result<()> {
        kv.put(&self.cf(db), self.entry(row, shard, pk).data(), b"")
    }

    pub fn delete(&self, db: &Db, row: &Sequence, shard: &[u8], pk: &[u8], kv: &Kv) -> Result<()> {
        kv.delete(&self.cf(db), self.entry(row, shard, pk).data())
    }

    /// Whether the stored entry would change between two versions of a row.
    pub fn touches(&self, old: &Sequence, new: &Sequence) -> bool {
        self.columns.iter().any(|c| old.at(*c) != new.at(*c))
    }

    /// Encode the longest fully-constrained prefix of the index columns
    /// into composite lookup values, consuming those constraints.
    /// Returns the lookup prefixes and how many columns they cover.
    pub fn encode_composite(&self, mapper: &mut ValueMapper) -> (Vec<Vec<u8>>, usize) {
        let mut prefixes: Vec<Vec<u8>> = vec![Vec::new()];
        let mut covered = 0;
        for column in &self.columns {
            if !mapper.has_values(*column) {
                break;
            }
            let values = mapper.release_values(*column);
            let mut next = Vec::with_capacity(prefixes.len() * values.len());
            for prefix in &prefixes {
                for value in &values {
                    let mut combined = prefix.clone();
                    if covered > 0 {
                        combined.push(super::encode::COMPOSITE_SEPARATOR);
                    }
                    combined.extend_from_slice(&encode_value(value));
                    next.push(combined);
                }
            }
            prefixes = next;
            covered += 1;
        }
        (prefixes, covered)
    }

    /// Look up `(shard, pk)` targets for the given encoded values.
    ///
    /// A full-prefix lookup appends the field separator so `v` cannot match
    /// `v2`; partial composite prefixes stay open-ended.
    pub fn get(
        &self,
        db: &Db,
        values: Vec<Vec<u8>>,
        exact: bool,
        kv: &Kv,
        limit: Option<usize>,
    ) -> Result<Vec<IndexRecord>> {
        let cf = self.cf(db);
        let mut out = Vec::new();
        for mut value in values {
            if exact {
                value.push(super::encode::SEPARATOR);
            }
            for (key, _) in kv.prefix(&cf, &value)? {
                let entry = IndexEntry::from_bytes(&key);
                out.push(entry.target());
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Like [`get`], restricted to the given shards.
    pub fn get_with_shards(
        &self,
        db: &Db,
        shards: &[Vec<u8>],
        values: Vec<Vec<u8>>,
        kv: &Kv,
    ) -> Result<Vec<IndexRecord>> {
        let records = self.get(db, values, true, kv, None)?;
        Ok(records
            .into_iter()
            .filter(|r| shards.iter().any(|s| s.as_slice() == r.shard()))
            .collect())
    }
}

/// The primary key index: `pk -> [shard, ...]`.
#[derive(Debug, Clone)]
pub struct RocksdbPkIndex {
    cf_name: String,
}

impl RocksdbPkIndex {
    pub fn cf_name_for(table_name: &str) -> String {
        format!("{}{}", table_name, PK_INDEX_SUFFIX)
    }

    pub fn new(table_name: &str) -> RocksdbPkIndex {
        RocksdbPkIndex {
            cf_name: Self::cf_name_for(table_name),
        }
    }

    pub fn name(&self) -> &str {
        &self.cf_name
    }

    fn cf<'db>(&self, db: &'db Db) -> CfRef<'db> {
        db.cf_handle(&self.cf_name).expect("pk index family missing")
    }

    pub fn add(&self, db: &Db, pk: &[u8], shard: &[u8], kv: &Kv) -> Result<()> {
        let cf = self.cf(db);
        let mut value = match kv.get_for_update(&cf, pk)? {
            Some(bytes) => PkIndexValue::from_bytes(&bytes),
            None => PkIndexValue::default(),
        };
        if !value.contains(shard) {
            value.append_shard(shard);
            kv.put(&cf, pk, value.data())?;
        }
        Ok(())
    }

    pub fn delete(&self, db: &Db, pk: &[u8], shard: &[u8], kv: &Kv) -> Result<()> {
        let cf = self.cf(db);
        if let Some(bytes) = kv.get_for_update(&cf, pk)? {
            let mut value = PkIndexValue::from_bytes(&bytes);
            value.remove_shard(shard);
            if value.is_empty() {
                kv.delete(&cf, pk)?;
            } else {
                kv.put(&cf, pk, value.data())?;
            }
        }
        Ok(())
    }

    /// Whether any row with this pk exists. Takes a conflict-detection lock
    /// so concurrent inserts of the same pk collide at commit.
    pub fn exists(&self, db: &Db, pk: &[u8], kv: &Kv) -> Result<bool> {
        Ok(kv.get_for_update(&self.cf(db), pk)?.is_some())
    }

    pub fn get(&self, db: &Db, pk_values: &[Vec<u8>], kv: &Kv) -> Result<Vec<IndexRecord>> {
        let cf = self.cf(db);
        let mut out = Vec::new();
        for pk in pk_values {
            if let Some(bytes) = kv.get(&cf, pk)? {
                for shard in PkIndexValue::from_bytes(&bytes).shards() {
                    out.push(IndexRecord::new(&shard, pk));
                }
            }
        }
        Ok(out)
    }

    /// Shard names holding each pk.
    pub fn shards_of(&self, db: &Db, pk: &[u8], kv: &Kv) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(db);
        Ok(match kv.get(&cf, pk)? {
            Some(bytes) => PkIndexValue::from_bytes(&bytes).shards(),
            None => Vec::new(),
        })
    }

    /// How many shards each pk value lives in.
    pub fn count_shards(&self, db: &Db, pk_values: &[Vec<u8>], kv: &Kv) -> Result<Vec<usize>> {
        let cf = self.cf(db);
        pk_values
            .iter()
            .map(|pk| {
                Ok(match kv.get(&cf, pk)? {
                    Some(bytes) => PkIndexValue::from_bytes(&bytes).count(),
                    None => 0,
                })
            })
            .collect()
    }
}

/// Pretty index description for EXPLAIN, e.g. `(name, city)`.
pub fn describe_columns(schema: &SchemaRef, columns: &[usize]) -> String {
    let names: Vec<&str> = columns.iter().map(|c| schema.name_of(*c)).collect();
    format!("({})", names.join(", "))
}
