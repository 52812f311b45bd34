//! Materialized views: the terminal operator of a flow.
//!
//! Three backings: hash-keyed (no ordering), ordered by the key columns,
//! or ordered inside each key group by a separate column list. Positive
//! records insert, negative records erase; a partial batch is never
//! visible because the owning partition applies batches under its lock.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use fnv::FnvHashMap;

use crate::dataflow::key::Key;
use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::dataflow::types::ColumnId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewOrder {
    /// Hash map keyed by the view key.
    Unordered,
    /// Iterable in key order.
    KeyOrdered,
    /// Rows inside each key group sorted on these columns.
    RecordOrdered(Vec<ColumnId>),
}

enum Backing {
    Unordered(FnvHashMap<Key, Vec<Record>>),
    KeyOrdered(BTreeMap<Key, Vec<Record>>),
    RecordOrdered {
        groups: FnvHashMap<Key, Vec<Record>>,
        sort: Vec<ColumnId>,
    },
}

pub struct MatViewOperator {
    key_columns: Vec<ColumnId>,
    backing: Backing,
    schema: Option<SchemaRef>,
    count: usize,
}

/// Ordering over a column subset, nulls first.
fn record_cmp(a: &Record, b: &Record, columns: &[ColumnId]) -> Ordering {
    for column in columns {
        let ordering = match (a.is_null(*column), b.is_null(*column)) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.value_ref(*column).sql_cmp(b.value_ref(*column)),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

impl MatViewOperator {
    pub fn new(key_columns: Vec<ColumnId>, order: ViewOrder) -> MatViewOperator {
        let backing = match &order {
            ViewOrder::Unordered => Backing::Unordered(FnvHashMap::default()),
            ViewOrder::KeyOrdered => Backing::KeyOrdered(BTreeMap::new()),
            ViewOrder::RecordOrdered(sort) => Backing::RecordOrdered {
                groups: FnvHashMap::default(),
                sort: sort.clone(),
            },
        };
        MatViewOperator {
            key_columns,
            backing,
            schema: None,
            count: 0,
        }
    }

    pub fn key_columns(&self) -> &[ColumnId] {
        &self.key_columns
    }

    pub fn schema(&self) -> &SchemaRef {
        self.schema.as_ref().expect("schema not computed")
    }

    pub fn clone_op(&self) -> MatViewOperator {
        let order = match &self.backing {
            Backing::Unordered(_) => ViewOrder::Unordered,
            Backing::KeyOrdered(_) => ViewOrder::KeyOrdered,
            Backing::RecordOrdered { sort, .. } => ViewOrder::RecordOrdered(sort.clone()),
        };
        let mut clone = MatViewOperator::new(self.key_columns.clone(), order);
        clone.schema = self.schema.clone();
        clone
    }

    pub fn compute_schema(&mut self, input: &SchemaRef) -> SchemaRef {
        self.schema = Some(input.clone());
        input.clone()
    }

    pub fn size_in_memory(&self) -> u64 {
        self.iter_all().map(|r| r.size_in_memory()).sum()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Terminal: consumes the batch, emits nothing.
    pub fn process(&mut self, batch: Vec<Record>) -> Vec<Record> {
        for record in batch {
            let key = record.get_values(&self.key_columns);
            if record.is_positive() {
                self.insert(key, record);
            } else {
                self.erase(&key, &record);
            }
        }
        Vec::new()
    }

    fn insert(&mut self, key: Key, record: Record) {
        self.count += 1;
        match &mut self.backing {
            Backing::Unordered(groups) => groups.entry(key).or_default().push(record),
            Backing::KeyOrdered(groups) => groups.entry(key).or_default().push(record),
            Backing::RecordOrdered { groups, sort } => {
                let group = groups.entry(key).or_default();
                let position = group
                    .binary_search_by(|r| record_cmp(r, &record, sort))
                    .unwrap_or_else(|p| p);
                group.insert(position, record);
            }
        }
    }

    fn erase(&mut self, key: &Key, record: &Record) {
        let erased = match &mut self.backing {
            Backing::Unordered(groups) => erase_from(groups.get_mut(key), record),
            Backing::KeyOrdered(groups) => erase_from(groups.get_mut(key), record),
            Backing::RecordOrdered { groups, .. } => erase_from(groups.get_mut(key), record),
        };
        if erased {
            self.count -= 1;
            match &mut self.backing {
                Backing::Unordered(groups) => drop_empty(groups, key),
                Backing::KeyOrdered(groups) => {
                    if groups.get(key).map(|g| g.is_empty()).unwrap_or(false) {
                        groups.remove(key);
                    }
                }
                Backing::RecordOrdered { groups, .. } => drop_empty(groups, key),
            }
        }
    }

    /// Rows under one key, bounded.
    pub fn lookup(&self, key: &Key, limit: Option<usize>, offset: usize) -> Vec<Record> {
        let group: &[Record] = match &self.backing {
            Backing::Unordered(groups) => groups.get(key).map(|g| g.as_slice()).unwrap_or(&[]),
            Backing::KeyOrdered(groups) => groups.get(key).map(|g| g.as_slice()).unwrap_or(&[]),
            Backing::RecordOrdered { groups, .. } => {
                groups.get(key).map(|g| g.as_slice()).unwrap_or(&[])
            }
        };
        group
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|r| r.copy())
            .collect()
    }

    pub fn contains(&self, key: &Key) -> bool {
        match &self.backing {
            Backing::Unordered(groups) => groups.contains_key(key),
            Backing::KeyOrdered(groups) => groups.contains_key(key),
            Backing::RecordOrdered { groups, .. } => groups.contains_key(key),
        }
    }

    fn iter_all(&self) -> Box<dyn Iterator<Item = &Record> + '_> {
        match &self.backing {
            Backing::Unordered(groups) => Box::new(groups.values().flatten()),
            Backing::KeyOrdered(groups) => Box::new(groups.values().flatten()),
            Backing::RecordOrdered { groups, .. } => Box::new(groups.values().flatten()),
        }
    }

    /// Everything, bounded. Key-ordered views iterate in key order.
    pub fn all(&self, limit: Option<usize>, offset: usize) -> Vec<Record> {
        self.iter_all()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|r| r.copy())
            .collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        match &self.backing {
            Backing::Unordered(groups) => groups.keys().cloned().collect(),
            Backing::KeyOrdered(groups) => groups.keys().cloned().collect(),
            Backing::RecordOrdered { groups, .. } => groups.keys().cloned().collect(),
        }
    }
}

fn erase_from(group: Option<&mut Vec<Record>>, record: &Record) -> bool {
    if let Some(group) = group {
        if let Some(position) = group.iter().position(|r| r == record) {
            group.remove(position);
            return true;
        }
    }
    false
}

fn drop_empty(groups: &mut FnvHashMap<Key, Vec<Record>>, key: &Key) {
    if groups.get(key).map(|g| g.is_empty()).unwrap_or(false) {
        groups.remove(key);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::{ColumnType, Value};

    fn schema() -> SchemaRef {
        SchemaRef::new(
            vec!["author".into(), "title".into()],
            vec![ColumnType::Int, ColumnType::Text],
            vec![0],
        )
    }

    fn row(author: i64, title: &str, positive: bool) -> Record {
        Record::from_values(
            schema(),
            positive,
            vec![Value::Int(author), Value::Text(title.into())],
        )
    }

    #[test]
    fn insert_lookup_erase() {
        let mut view = MatViewOperator::new(vec![0], ViewOrder::Unordered);
        view.compute_schema(&schema());
        view.process(vec![row(1, "a", true), row(1, "b", true), row(2, "c", true)]);

        let key = Key::from(Value::Int(1));
        assert_eq!(view.lookup(&key, None, 0).len(), 2);
        assert_eq!(view.count(), 3);

        view.process(vec![row(1, "a", false)]);
        assert_eq!(view.lookup(&key, None, 0).len(), 1);
        assert_eq!(view.count(), 2);
    }

    #[test]
    fn limit_and_offset() {
        let mut view = MatViewOperator::new(vec![0], ViewOrder::RecordOrdered(vec![1]));
        view.compute_schema(&schema());
        view.process(vec![row(1, "c", true), row(1, "a", true), row(1, "b", true)]);
        let key = Key::from(Value::Int(1));
        let page = view.lookup(&key, Some(2), 1);
        assert_eq!(page.len(), 2);
        // Sorted by title, offset past "a".
        assert_eq!(page[0].get_value(1), Value::Text("b".into()));
        assert_eq!(page[1].get_value(1), Value::Text("c".into()));
    }

    #[test]
    fn key_ordered_iterates_in_order() {
        let mut view = MatViewOperator::new(vec![0], ViewOrder::KeyOrdered);
        view.compute_schema(&schema());
        view.process(vec![row(3, "x", true), row(1, "y", true), row(2, "z", true)]);
        let all = view.all(None, 0);
        let authors: Vec<i64> = all.iter().map(|r| r.get_int(0)).collect();
        assert_eq!(authors, vec![1, 2, 3]);
    }

    #[test]
    fn erase_of_missing_row_is_noop() {
        let mut view = MatViewOperator::new(vec![0], ViewOrder::Unordered);
        view.compute_schema(&schema());
        view.process(vec![row(1, "a", true)]);
        view.process(vec![row(1, "zzz", false)]);
        assert_eq!(view.count(), 1);
    }
}
