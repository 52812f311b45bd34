//! Schema and key-material persistence.
//!
//! Two reserved column families survive restarts: `__keys__` holds the
//! global key, the global nonce and every per-user key; `__statements__`
//! holds each CREATE statement in execution order so a reopened database
//! can rebuild its tables, indices and views by re-running them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rocksdb::Options;

use k9db_sqlast::Statement;

use super::encode::SEPARATOR;
use super::transaction::{CfRef, Db};

pub const KEYS_CF: &str = "__keys__";
pub const STATEMENTS_CF: &str = "__statements__";

const GLOBAL_KEY: &[u8] = b"global_key";
const GLOBAL_NONCE: &[u8] = b"global_nonce";
const USER_PREFIX: &[u8] = b"user";

pub struct RocksdbMetadata {
    /// Column families present in the store.
    known_cfs: Mutex<HashSet<String>>,
    /// Views whose CREATE statement is already on disk.
    persisted_views: Mutex<HashSet<String>>,
    /// Policies (table.column) whose CREATE statement is already on disk.
    persisted_policies: Mutex<HashSet<String>>,
    /// Orders persisted statements across restarts.
    counter: AtomicU64,
}

impl RocksdbMetadata {
    /// Set up the reserved column families and remember which families
    /// already exist on disk.
    pub fn initialize(db: &Db, existing_cfs: Vec<String>) -> RocksdbMetadata {
        let metadata = RocksdbMetadata {
            known_cfs: Mutex::new(existing_cfs.into_iter().collect()),
            persisted_views: Mutex::new(HashSet::new()),
            persisted_policies: Mutex::new(HashSet::new()),
            counter: AtomicU64::new(0),
        };
        metadata.ensure_cf(db, KEYS_CF);
        metadata.ensure_cf(db, STATEMENTS_CF);
        metadata
    }

    /// Create the column family if this store has never seen it.
    /// Returns true if it already existed.
    pub fn ensure_cf(&self, db: &Db, name: &str) -> bool {
        let mut known = self.known_cfs.lock();
        if known.contains(name) {
            return true;
        }
        db.create_cf(name, &Options::default())
            .expect("cannot create column family");
        known.insert(name.to_string());
        false
    }

    fn cf<'db>(db: &'db Db, name: &str) -> CfRef<'db> {
        db.cf_handle(name).expect("reserved column family missing")
    }

    /* Persisted statements. */

    /// Reload all persisted CREATE statements in their original order and
    /// position the counter after them.
    pub fn load_statements(&self, db: &Db) -> Vec<Statement> {
        let cf = Self::cf(db, STATEMENTS_CF);
        let mut statements = Vec::new();
        let iterator = db.iterator_cf(&cf, rocksdb::IteratorMode::Start);
        for item in iterator {
            let (_, value) = item.expect("cannot read persisted statements");
            let statement: Statement =
                serde_json::from_slice(&value).expect("corrupt persisted statement");
            match &statement {
                Statement::CreateView(view) => {
                    self.persisted_views.lock().insert(view.view_name.clone());
                }
                Statement::CreatePolicy(policy) => {
                    self.persisted_policies
                        .lock()
                        .insert(format!("{}.{}", policy.table_name, policy.column));
                }
                _ => {}
            }
            statements.push(statement);
        }
        self.counter.store(statements.len() as u64, Ordering::SeqCst);
        statements
    }

    /// Persist a CREATE VIEW once; reopens hand it back for re-planning.
    pub fn persist_view(&self, db: &Db, statement: &Statement) {
        let Statement::CreateView(view) = statement else {
            panic!("not a view statement");
        };
        if self.persisted_views.lock().insert(view.view_name.clone()) {
            self.persist_statement(db, statement);
        }
    }

    /// Persist a CREATE POLICY once per (table, column).
    pub fn persist_policy(&self, db: &Db, statement: &Statement) {
        let Statement::CreatePolicy(policy) = statement else {
            panic!("not a policy statement");
        };
        let key = format!("{}.{}", policy.table_name, policy.column);
        if self.persisted_policies.lock().insert(key) {
            self.persist_statement(db, statement);
        }
    }

    pub fn persist_statement(&self, db: &Db, statement: &Statement) {
        let cf = Self::cf(db, STATEMENTS_CF);
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(statement).expect("cannot serialize statement");
        db.put_cf(&cf, index.to_be_bytes(), value)
            .expect("cannot persist statement");
    }

    /* Encryption keys. */

    pub fn load_global_key(&self, db: &Db) -> Option<Vec<u8>> {
        db.get_cf(&Self::cf(db, KEYS_CF), GLOBAL_KEY)
            .expect("cannot read key material")
    }

    pub fn load_global_nonce(&self, db: &Db) -> Option<Vec<u8>> {
        db.get_cf(&Self::cf(db, KEYS_CF), GLOBAL_NONCE)
            .expect("cannot read key material")
    }

    pub fn persist_global_key(&self, db: &Db, key: &[u8]) {
        db.put_cf(&Self::cf(db, KEYS_CF), GLOBAL_KEY, key)
            .expect("cannot persist key material");
    }

    pub fn persist_global_nonce(&self, db: &Db, nonce: &[u8]) {
        db.put_cf(&Self::cf(db, KEYS_CF), GLOBAL_NONCE, nonce)
            .expect("cannot persist key material");
    }

    fn user_row(user_id: &str) -> Vec<u8> {
        let mut key = USER_PREFIX.to_vec();
        key.push(SEPARATOR);
        key.extend_from_slice(user_id.as_bytes());
        key
    }

    pub fn load_user_keys(&self, db: &Db) -> Vec<(String, Vec<u8>)> {
        let cf = Self::cf(db, KEYS_CF);
        let mut prefix = USER_PREFIX.to_vec();
        prefix.push(SEPARATOR);
        let mut keys = Vec::new();
        let mut options = rocksdb::ReadOptions::default();
        options.set_iterate_range(rocksdb::PrefixRange(prefix.clone()));
        let mode = rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward);
        for item in db.iterator_cf_opt(&cf, options, mode) {
            let (key, value) = item.expect("cannot read key material");
            let user = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            keys.push((user, value.to_vec()));
        }
        keys
    }

    pub fn persist_user_key(&self, db: &Db, user_id: &str, key: &[u8]) {
        db.put_cf(&Self::cf(db, KEYS_CF), Self::user_row(user_id), key)
            .expect("cannot persist key material");
    }

    pub fn delete_user_key(&self, db: &Db, user_id: &str) {
        db.delete_cf(&Self::cf(db, KEYS_CF), Self::user_row(user_id))
            .expect("cannot delete key material");
    }
}
