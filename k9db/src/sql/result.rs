//! Result containers returned by the storage layer.

use std::collections::HashMap;

use k9db_sqlast::Value;

use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::util::ShardName;

/// A `(shard, value)` pair for direct lookups.
pub type KeyPair = (ShardName, Value);

/// Rows of one schema.
#[derive(Debug)]
pub struct SqlResultSet {
    schema: SchemaRef,
    rows: Vec<Record>,
}

impl SqlResultSet {
    pub fn empty(schema: SchemaRef) -> SqlResultSet {
        SqlResultSet {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn new(schema: SchemaRef, rows: Vec<Record>) -> SqlResultSet {
        SqlResultSet { schema, rows }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Record] {
        &mut self.rows
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }
}

/// Outcome of executing one statement.
#[derive(Debug)]
pub enum SqlResult {
    /// DDL success/failure.
    Statement(bool),
    /// Row count affected by DML.
    Update(usize),
    /// Result sets of a query.
    ResultSets(Vec<SqlResultSet>),
}

impl SqlResult {
    pub fn rows_affected(&self) -> usize {
        match self {
            SqlResult::Update(count) => *count,
            _ => 0,
        }
    }

    pub fn result_sets(&self) -> &[SqlResultSet] {
        match self {
            SqlResult::ResultSets(sets) => sets,
            _ => &[],
        }
    }

    pub fn into_result_sets(self) -> Vec<SqlResultSet> {
        match self {
            SqlResult::ResultSets(sets) => sets,
            _ => Vec::new(),
        }
    }
}

/// Deleted rows, deduplicated, with the shards each was removed from.
///
/// `count` is the number of physical deletions (shard copies), while
/// `rows` holds each logical row once, as a negative record.
#[derive(Debug, Default)]
pub struct SqlDeleteSet {
    rows: Vec<Record>,
    shards: HashMap<ShardName, Vec<usize>>,
    pks: HashMap<Vec<u8>, usize>,
    count: usize,
}

impl SqlDeleteSet {
    pub fn new() -> SqlDeleteSet {
        SqlDeleteSet::default()
    }

    /// Record one physical deletion of `record` (keyed by encoded pk) from
    /// `shard`.
    pub fn add(&mut self, pk: Vec<u8>, record: Record, shard: ShardName) {
        let index = match self.pks.get(&pk) {
            Some(index) => *index,
            None => {
                let mut negative = record;
                negative.set_positive(false);
                self.rows.push(negative);
                self.pks.insert(pk, self.rows.len() - 1);
                self.rows.len() - 1
            }
        };
        self.shards.entry(shard).or_default().push(index);
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardName> {
        self.shards.keys()
    }

    pub fn rows_of(&self, shard: &ShardName) -> impl Iterator<Item = &Record> {
        self.shards
            .get(shard)
            .into_iter()
            .flatten()
            .map(|i| &self.rows[*i])
    }

    /// `(shard, row position)` pairs, one per physical deletion.
    pub fn assignments(&self) -> impl Iterator<Item = (&ShardName, usize)> {
        self.shards
            .iter()
            .flat_map(|(shard, indices)| indices.iter().map(move |i| (shard, *i)))
    }

    pub fn row(&self, position: usize) -> &Record {
        &self.rows[position]
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }
}

/// Updated rows as deduplicated `(old, new)` pairs plus shard assignments.
#[derive(Debug, Default)]
pub struct SqlUpdateSet {
    /// Alternating negative old and positive new records.
    rows: Vec<Record>,
    shards: HashMap<ShardName, Vec<usize>>,
    pks: HashMap<Vec<u8>, usize>,
    count: usize,
}

impl SqlUpdateSet {
    pub fn new() -> SqlUpdateSet {
        SqlUpdateSet::default()
    }

    /// Record one physical update in `shard`. Returns the pair index.
    pub fn add(&mut self, pk: Vec<u8>, old: Record, new: Record, shard: ShardName) -> usize {
        let index = match self.pks.get(&pk) {
            Some(index) => *index,
            None => {
                let mut negative = old;
                negative.set_positive(false);
                let mut positive = new;
                positive.set_positive(true);
                self.rows.push(negative);
                self.rows.push(positive);
                self.pks.insert(pk, self.rows.len() - 2);
                self.rows.len() - 2
            }
        };
        self.shards.entry(shard).or_default().push(index);
        self.count += 1;
        index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// `(shard, old, new)` triples.
    pub fn assignments(&self) -> impl Iterator<Item = (&ShardName, &Record, &Record)> {
        self.shards.iter().flat_map(move |(shard, indices)| {
            indices
                .iter()
                .map(move |i| (shard, &self.rows[*i], &self.rows[*i + 1]))
        })
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }
}
