//! Key-value engine adapter.
//!
//! One `OptimisticTransactionDB` per database. Writers run inside a
//! transaction with conflict detection through `get_for_update`; a conflict
//! at commit surfaces as a retryable error with no side effects. Readers
//! that never write use a point-in-time snapshot and do not block writers.
//! Prefix scans are bounded with `PrefixRange` so an iterator can never
//! leave its shard.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, Direction, IteratorMode, MultiThreaded, Options, PrefixRange, ReadOptions,
    SnapshotWithThreadMode, Transaction,
};

use crate::error::{Error, Result};

pub type Db = rocksdb::OptimisticTransactionDB<MultiThreaded>;
pub type CfRef<'db> = Arc<BoundColumnFamily<'db>>;

/// Open (or create) the store with every column family found on disk.
pub fn open(path: &Path) -> Result<(Db, Vec<String>)> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);

    let existing = rocksdb::DB::list_cf(&options, path).unwrap_or_default();
    let descriptors: Vec<_> = existing
        .iter()
        .map(|name| rocksdb::ColumnFamilyDescriptor::new(name, Options::default()))
        .collect();

    let db = if descriptors.is_empty() {
        Db::open(&options, path)?
    } else {
        Db::open_cf_descriptors(&options, path, descriptors)?
    };
    Ok((db, existing))
}

/// A unit of isolation: either a write transaction or a read snapshot.
pub enum Kv<'db> {
    Write(Transaction<'db, Db>),
    Read(SnapshotWithThreadMode<'db, Db>),
}

impl<'db> Kv<'db> {
    pub fn write(db: &'db Db) -> Kv<'db> {
        Kv::Write(db.transaction())
    }

    pub fn read(db: &'db Db) -> Kv<'db> {
        Kv::Read(SnapshotWithThreadMode::new(db))
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Kv::Write(_))
    }

    pub fn get(&self, cf: &CfRef, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Kv::Write(txn) => Ok(txn.get_cf(cf, key)?),
            Kv::Read(snapshot) => Ok(snapshot.get_cf(cf, key)?),
        }
    }

    /// Read and take a conflict-detection lock on the key.
    pub fn get_for_update(&self, cf: &CfRef, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Kv::Write(txn) => Ok(txn.get_for_update_cf(cf, key, true)?),
            Kv::Read(snapshot) => Ok(snapshot.get_cf(cf, key)?),
        }
    }

    pub fn multi_get(&self, cf: &CfRef, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(cf, key)).collect()
    }

    pub fn put(&self, cf: &CfRef, key: &[u8], value: &[u8]) -> Result<()> {
        match self {
            Kv::Write(txn) => Ok(txn.put_cf(cf, key, value)?),
            Kv::Read(_) => panic!("put on a read snapshot"),
        }
    }

    pub fn delete(&self, cf: &CfRef, key: &[u8]) -> Result<()> {
        match self {
            Kv::Write(txn) => Ok(txn.delete_cf(cf, key)?),
            Kv::Read(_) => panic!("delete on a read snapshot"),
        }
    }

    /// All `(key, value)` pairs whose key starts with `prefix`.
    pub fn prefix(&self, cf: &CfRef, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut options = ReadOptions::default();
        options.set_iterate_range(PrefixRange(prefix.to_vec()));
        let mode = IteratorMode::From(prefix, Direction::Forward);
        let mut out = Vec::new();
        match self {
            Kv::Write(txn) => {
                for item in txn.iterator_cf_opt(cf, options, mode) {
                    let (key, value) = item?;
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
            Kv::Read(snapshot) => {
                for item in snapshot.iterator_cf_opt(cf, options, mode) {
                    let (key, value) = item?;
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
        }
        Ok(out)
    }

    /// Full scan of a column family.
    pub fn all(&self, cf: &CfRef) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let options = ReadOptions::default();
        let mut out = Vec::new();
        match self {
            Kv::Write(txn) => {
                for item in txn.iterator_cf_opt(cf, options, IteratorMode::Start) {
                    let (key, value) = item?;
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
            Kv::Read(snapshot) => {
                for item in snapshot.iterator_cf_opt(cf, options, IteratorMode::Start) {
                    let (key, value) = item?;
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
        }
        Ok(out)
    }

    /// Commit a write transaction. A conflict comes back as
    /// [`Error::Busy`]; the transaction has already been unwound.
    pub fn commit(self) -> Result<()> {
        match self {
            Kv::Write(txn) => txn.commit().map_err(Error::from),
            Kv::Read(_) => Ok(()),
        }
    }

    pub fn rollback(self) -> Result<()> {
        match self {
            Kv::Write(txn) => txn.rollback().map_err(Error::from),
            Kv::Read(_) => Ok(()),
        }
    }
}
