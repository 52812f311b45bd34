//! Storage connection: global engine state and schema operations.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;

use k9db_sqlast::{ColumnConstraint, CreateIndex, CreateTable, CreateView, Statement};

use super::encryption::EncryptionManager;
use super::metadata::RocksdbMetadata;
use super::session::RocksdbSession;
use super::table::RocksdbTable;
use super::transaction::{self, Db, Kv};
use crate::dataflow::schema::SchemaRef;
use crate::error::{Error, Result};

/// Owns the rocksdb handle, the per-table storage objects, the encryption
/// manager and the persisted metadata. Sessions borrow this.
pub struct RocksdbConnection {
    db: Db,
    metadata: RocksdbMetadata,
    encryption: EncryptionManager,
    tables: RwLock<HashMap<String, RocksdbTable>>,
}

impl RocksdbConnection {
    /// Open the store and return the CREATE statements persisted by earlier
    /// runs, in execution order. Re-running them rebuilds the schema, the
    /// indices and the view topology.
    pub fn open(path: &Path) -> Result<(RocksdbConnection, Vec<Statement>)> {
        let (db, existing) = transaction::open(path)?;
        let metadata = RocksdbMetadata::initialize(&db, existing);
        let statements = metadata.load_statements(&db);
        let encryption = EncryptionManager::initialize(&db, &metadata);
        tracing::info!(
            statements = statements.len(),
            "opened store at {}",
            path.display()
        );
        Ok((
            RocksdbConnection {
                db,
                metadata,
                encryption,
                tables: RwLock::new(HashMap::new()),
            },
            statements,
        ))
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn metadata(&self) -> &RocksdbMetadata {
        &self.metadata
    }

    pub(crate) fn encryption(&self) -> &EncryptionManager {
        &self.encryption
    }

    pub(crate) fn with_table<T>(
        &self,
        table_name: &str,
        f: impl FnOnce(&RocksdbTable) -> Result<T>,
    ) -> Result<T> {
        let tables = self.tables.read();
        let table = tables
            .get(table_name)
            .ok_or_else(|| Error::UnknownTable(table_name.to_string()))?;
        f(table)
    }

    pub fn table_schema(&self, table_name: &str) -> Result<SchemaRef> {
        self.with_table(table_name, |t| Ok(t.schema().clone()))
    }

    /// Create the physical table: its column family, its PK index, and an
    /// automatic secondary index for every unique and foreign key column.
    pub fn execute_create_table(&self, stmt: &CreateTable) -> Result<bool> {
        let schema = SchemaRef::from_create_table(stmt);
        let fresh = !self.metadata.ensure_cf(&self.db, &stmt.table_name);
        let mut table = RocksdbTable::new(&self.db, &self.metadata, &stmt.table_name, schema);

        for (i, column) in stmt.columns.iter().enumerate() {
            let unique = column
                .constraints
                .iter()
                .any(|c| matches!(c, ColumnConstraint::Unique));
            if unique {
                table.add_unique_column(i);
                table.create_index(&self.db, &self.metadata, vec![i]);
            }
            if column.foreign_key().is_some() {
                table.create_index(&self.db, &self.metadata, vec![i]);
            }
        }

        self.tables.write().insert(stmt.table_name.clone(), table);
        if fresh {
            self.metadata
                .persist_statement(&self.db, &Statement::CreateTable(stmt.clone()));
        }
        Ok(true)
    }

    pub fn execute_create_index(&self, stmt: &CreateIndex) -> Result<bool> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&stmt.table_name)
            .ok_or_else(|| Error::UnknownTable(stmt.table_name.clone()))?;
        let schema = table.schema().clone();
        let mut columns = Vec::with_capacity(stmt.columns.len());
        for name in &stmt.columns {
            columns.push(schema.index_of(name).ok_or_else(|| {
                Error::invalid(
                    "CREATE INDEX",
                    &stmt.table_name,
                    Some(name),
                    "unknown column",
                )
            })?);
        }
        let cf_name = RocksdbTable::index_cf_would_exist(&stmt.table_name, &columns);
        let fresh = !self.metadata.ensure_cf(&self.db, &cf_name);
        table.create_index(&self.db, &self.metadata, columns);
        if fresh {
            self.metadata
                .persist_statement(&self.db, &Statement::CreateIndex(stmt.clone()));
        }
        Ok(true)
    }

    /// Views are planned outside the storage layer; we only persist the
    /// statement so reopening rebuilds the dataflow.
    pub fn persist_create_view(&self, stmt: &CreateView) -> Result<bool> {
        self.metadata
            .persist_view(&self.db, &Statement::CreateView(stmt.clone()));
        Ok(true)
    }

    /// Persist a policy schema so reopening re-registers it.
    pub fn persist_create_policy(&self, stmt: &k9db_sqlast::CreatePolicy) -> Result<bool> {
        self.metadata
            .persist_policy(&self.db, &Statement::CreatePolicy(stmt.clone()));
        Ok(true)
    }

    /// Largest stored value of an integer column, used to restore
    /// AUTO_INCREMENT counters on reopen.
    pub fn get_maximum_value(&self, table_name: &str, column_name: &str) -> Result<i64> {
        self.with_table(table_name, |table| {
            let schema = table.schema();
            let column = schema
                .index_of(column_name)
                .ok_or_else(|| Error::UnknownTable(table_name.to_string()))?;
            let kv = Kv::read(&self.db);
            let mut max = 0;
            for (key, value) in table.get_all(&self.db, &kv)? {
                let shard = self.encryption.decrypt_shard(&key);
                let row = self.encryption.decrypt_value(shard.user_id(), &value);
                let record = row.decode_record(schema, true);
                if !record.is_null(column) {
                    max = max.max(record.get_int(column));
                }
            }
            Ok(max)
        })
    }

    /// The index a WHERE clause would be answered with, for EXPLAIN.
    pub fn describe_plan(
        &self,
        table_name: &str,
        mapper: &k9db_sqlast::ValueMapper,
    ) -> Option<String> {
        self.with_table(table_name, |table| {
            Ok(table.choose_index(mapper).index_description())
        })
        .ok()
    }

    /// Destroy a user's key material after a forget.
    pub fn forget_user(&self, user_id: &str) {
        self.encryption.forget_user(&self.db, &self.metadata, user_id);
    }

    /// Index column lists of a table, for EXPLAIN.
    pub fn index_descriptions(&self, table_name: &str) -> Vec<String> {
        self.with_table(table_name, |table| {
            let schema = table.schema().clone();
            Ok(table
                .index_descriptions()
                .into_iter()
                .map(|cols| super::index::describe_columns(&schema, &cols))
                .collect())
        })
        .unwrap_or_default()
    }

    pub fn session(&self) -> RocksdbSession<'_> {
        RocksdbSession::new(self)
    }
}
