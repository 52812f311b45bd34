//! Ownership graph metadata.
//!
//! Each table records the ways its rows are assigned to shards (owners),
//! the ways they can be reached without ownership (accessors), and the
//! inverse edges (dependents) used for cascades. A descriptor's kind says
//! how the data subject is found: directly from a column value, through a
//! chain of foreign keys, or backwards through an association table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicI64;

use k9db_sqlast::{AnonymizationRule, ColumnType, CreateTable, Value};

use crate::dataflow::schema::SchemaRef;

pub type ShardKind = String;
pub type TableName = String;
pub type ColumnName = String;
pub type ColumnIndex = usize;

/// A chain index resolving "FK value -> owning data subjects" across
/// transitive hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub index_name: String,
    /// The table one hop closer to the data subject.
    pub table_name: TableName,
    pub shard_kind: ShardKind,
    pub column_name: ColumnName,
    pub column_index: ColumnIndex,
}

/// The column value is itself a data-subject id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectInfo {
    pub column: ColumnName,
    pub column_index: ColumnIndex,
    pub column_type: ColumnType,
    /// The referenced column in the data-subject table.
    pub next_column: ColumnName,
    pub next_column_index: ColumnIndex,
}

/// The column points at an intermediate table that is itself owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitiveInfo {
    pub column: ColumnName,
    pub column_index: ColumnIndex,
    pub column_type: ColumnType,
    pub next_table: TableName,
    pub next_column: ColumnName,
    pub next_column_index: ColumnIndex,
    /// Resolves FK values to the data subjects reachable through the
    /// chain. Absent for accessorship edges.
    pub index: Option<IndexDescriptor>,
}

/// Another table's OWNS/ACCESSES column points back at this table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    /// The column in this table the origin FK targets, always the pk.
    pub column: ColumnName,
    pub column_index: ColumnIndex,
    pub column_type: ColumnType,
    pub origin_table: TableName,
    pub origin_column: ColumnName,
    pub origin_column_index: ColumnIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingInfo {
    Direct(DirectInfo),
    Transitive(TransitiveInfo),
    Variable(VariableInfo),
}

/// One way a table's rows are assigned to (or reached from) shards of one
/// kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_kind: ShardKind,
    pub info: ShardingInfo,
}

impl ShardDescriptor {
    pub fn is_transitive(&self) -> bool {
        matches!(self.info, ShardingInfo::Transitive(_))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.info, ShardingInfo::Variable(_))
    }

    /// The annotated column in the described table.
    pub fn column(&self) -> &ColumnName {
        match &self.info {
            ShardingInfo::Direct(info) => &info.column,
            ShardingInfo::Transitive(info) => &info.column,
            ShardingInfo::Variable(info) => &info.column,
        }
    }

    pub fn column_index(&self) -> ColumnIndex {
        match &self.info {
            ShardingInfo::Direct(info) => info.column_index,
            ShardingInfo::Transitive(info) => info.column_index,
            ShardingInfo::Variable(info) => info.column_index,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match &self.info {
            ShardingInfo::Direct(info) => info.column_type,
            ShardingInfo::Transitive(info) => info.column_type,
            ShardingInfo::Variable(info) => info.column_type,
        }
    }

    /// The table one hop closer to the data subject, regardless of the
    /// arrow's direction.
    pub fn next_table(&self) -> &TableName {
        match &self.info {
            ShardingInfo::Direct(_) => &self.shard_kind,
            ShardingInfo::Transitive(info) => &info.next_table,
            ShardingInfo::Variable(info) => &info.origin_table,
        }
    }

    /// The FK endpoint column in `next_table`.
    pub fn upcolumn(&self) -> &ColumnName {
        match &self.info {
            ShardingInfo::Direct(info) => &info.next_column,
            ShardingInfo::Transitive(info) => &info.next_column,
            ShardingInfo::Variable(info) => &info.origin_column,
        }
    }

    pub fn upcolumn_index(&self) -> ColumnIndex {
        match &self.info {
            ShardingInfo::Direct(info) => info.next_column_index,
            ShardingInfo::Transitive(info) => info.next_column_index,
            ShardingInfo::Variable(info) => info.origin_column_index,
        }
    }

    pub fn index_descriptor(&self) -> Option<&IndexDescriptor> {
        match &self.info {
            ShardingInfo::Transitive(info) => info.index.as_ref(),
            _ => None,
        }
    }
}

/// Everything the sharder knows about one table.
#[derive(Debug)]
pub struct Table {
    pub table_name: TableName,
    pub schema: SchemaRef,
    pub create_stmt: CreateTable,
    /// Next value for the AUTO_INCREMENT column, restored from the stored
    /// maximum on reopen.
    pub counter: Option<AtomicI64>,
    pub auto_increments: HashSet<ColumnName>,
    pub defaults: HashMap<ColumnName, Value>,
    /// Non-empty owners means the table is sharded.
    pub owners: Vec<ShardDescriptor>,
    pub accessors: Vec<ShardDescriptor>,
    /// Tables whose row placement depends on rows of this table, with the
    /// dependent-side descriptor.
    pub dependents: Vec<(TableName, ShardDescriptor)>,
    pub access_dependents: Vec<(TableName, ShardDescriptor)>,
}

impl Table {
    pub fn new(stmt: CreateTable, schema: SchemaRef) -> Table {
        Table {
            table_name: stmt.table_name.clone(),
            schema,
            create_stmt: stmt,
            counter: None,
            auto_increments: HashSet::new(),
            defaults: HashMap::new(),
            owners: Vec::new(),
            accessors: Vec::new(),
            dependents: Vec::new(),
            access_dependents: Vec::new(),
        }
    }

    pub fn is_sharded(&self) -> bool {
        !self.owners.is_empty()
    }

    pub fn anonymization_rules(&self) -> &[AnonymizationRule] {
        &self.create_stmt.anonymization_rules
    }
}

/// Metadata about one shard kind.
#[derive(Debug)]
pub struct Shard {
    pub shard_kind: ShardKind,
    pub id_column: ColumnName,
    pub id_column_index: ColumnIndex,
    /// Sharded tables stored inside shards of this kind.
    pub owned_tables: HashSet<TableName>,
    /// Tables reachable from this kind without ownership.
    pub accessor_tables: HashSet<TableName>,
}
