//! Hash equi-join operator.
//!
//! Maintains both sides grouped by join key. INNER emits matches only;
//! LEFT and RIGHT additionally emit null-padded rows for unmatched records
//! and must retract that padding the moment a match appears, so the
//! operator remembers every padded row it has emitted.

use fnv::FnvHashMap;
use k9db_sqlast::Value;

use crate::dataflow::key::Key;
use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::dataflow::types::ColumnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Inner,
    Left,
    Right,
}

/// Records of one side grouped by their join key.
#[derive(Debug, Default)]
struct GroupedData {
    groups: FnvHashMap<Key, Vec<Record>>,
}

impl GroupedData {
    fn insert(&mut self, key: Key, record: Record) {
        self.groups.entry(key).or_default().push(record);
    }

    /// Remove one record equal to `record`; true if one was there.
    fn erase(&mut self, key: &Key, record: &Record) -> bool {
        if let Some(group) = self.groups.get_mut(key) {
            if let Some(position) = group.iter().position(|r| r == record) {
                group.remove(position);
                if group.is_empty() {
                    self.groups.remove(key);
                }
                return true;
            }
        }
        false
    }

    fn get(&self, key: &Key) -> &[Record] {
        self.groups.get(key).map(|g| g.as_slice()).unwrap_or(&[])
    }

    fn contains(&self, key: &Key) -> bool {
        self.groups.contains_key(key)
    }

    fn size_in_memory(&self) -> u64 {
        self.groups
            .values()
            .flat_map(|g| g.iter().map(|r| r.size_in_memory()))
            .sum()
    }
}

pub struct EquiJoinOperator {
    left_id: ColumnId,
    right_id: ColumnId,
    mode: JoinMode,
    left_table: GroupedData,
    right_table: GroupedData,
    /// Null-padded rows currently emitted, per join key.
    emitted_nulls: GroupedData,
    left_schema: Option<SchemaRef>,
    right_schema: Option<SchemaRef>,
    output_schema: Option<SchemaRef>,
}

impl EquiJoinOperator {
    pub fn new(left_id: ColumnId, right_id: ColumnId, mode: JoinMode) -> EquiJoinOperator {
        EquiJoinOperator {
            left_id,
            right_id,
            mode,
            left_table: GroupedData::default(),
            right_table: GroupedData::default(),
            emitted_nulls: GroupedData::default(),
            left_schema: None,
            right_schema: None,
            output_schema: None,
        }
    }

    pub fn clone_op(&self) -> EquiJoinOperator {
        EquiJoinOperator {
            left_table: GroupedData::default(),
            right_table: GroupedData::default(),
            emitted_nulls: GroupedData::default(),
            left_schema: self.left_schema.clone(),
            right_schema: self.right_schema.clone(),
            output_schema: self.output_schema.clone(),
            ..EquiJoinOperator::new(self.left_id, self.right_id, self.mode)
        }
    }

    pub fn debug_string(&self) -> String {
        format!("equijoin({:?})", self.mode)
    }

    pub fn size_in_memory(&self) -> u64 {
        self.left_table.size_in_memory()
            + self.right_table.size_in_memory()
            + self.emitted_nulls.size_in_memory()
    }

    /// Output: left columns then right columns with the right join column
    /// dropped (it duplicates the left one).
    pub fn compute_schema(&mut self, left: &SchemaRef, right: &SchemaRef) -> SchemaRef {
        let mut names: Vec<String> = left.column_names().to_vec();
        let mut types = left.column_types().to_vec();
        for (i, name) in right.column_names().iter().enumerate() {
            if i == self.right_id {
                continue;
            }
            names.push(name.clone());
            types.push(right.type_of(i));
        }
        let keys = left.keys().to_vec();
        self.left_schema = Some(left.clone());
        self.right_schema = Some(right.clone());
        let schema = SchemaRef::new(names, types, keys);
        self.output_schema = Some(schema.clone());
        schema
    }

    fn joined(&self, left: &Record, right: &Record, positive: bool) -> Record {
        let schema = self.output_schema.as_ref().expect("schema not computed");
        let mut values: Vec<Value> = left.values().to_vec();
        for (i, value) in right.values().iter().enumerate() {
            if i != self.right_id {
                values.push(value.clone());
            }
        }
        Record::from_values(schema.clone(), positive, values)
    }

    /// `left + NULLs` for LEFT mode.
    fn left_padded(&self, left: &Record, positive: bool) -> Record {
        let schema = self.output_schema.as_ref().unwrap();
        let mut values: Vec<Value> = left.values().to_vec();
        values.resize(schema.size(), Value::Null);
        Record::from_values(schema.clone(), positive, values)
    }

    /// `NULLs + right` for RIGHT mode.
    fn right_padded(&self, right: &Record, positive: bool) -> Record {
        let schema = self.output_schema.as_ref().unwrap();
        let left_size = self.left_schema.as_ref().unwrap().size();
        let mut values = vec![Value::Null; left_size];
        for (i, value) in right.values().iter().enumerate() {
            if i != self.right_id {
                values.push(value.clone());
            }
        }
        Record::from_values(schema.clone(), positive, values)
    }

    /// `source` is the parent position: 0 = left, 1 = right.
    pub fn process(&mut self, source: usize, batch: Vec<Record>) -> Vec<Record> {
        let mut output = Vec::new();
        for record in batch {
            match source {
                0 => self.process_left(record, &mut output),
                1 => self.process_right(record, &mut output),
                _ => panic!("join has two parents"),
            }
        }
        output
    }

    fn process_left(&mut self, record: Record, output: &mut Vec<Record>) {
        let key = record.get_values(&[self.left_id]);
        let positive = record.is_positive();
        if positive {
            // A first match retracts any null padding emitted for the
            // other side.
            if self.mode == JoinMode::Right && !self.left_table.contains(&key) {
                for right in self.right_table.get(&key) {
                    let padded = self.right_padded(right, false);
                    if self.emitted_nulls.erase(&key, &padded) {
                        output.push(padded);
                    }
                }
            }
            for right in self.right_table.get(&key) {
                output.push(self.joined(&record, right, true));
            }
            if self.mode == JoinMode::Left && self.right_table.get(&key).is_empty() {
                let padded = self.left_padded(&record, true);
                self.emitted_nulls.insert(key.clone(), padded.copy());
                output.push(padded);
            }
            self.left_table.insert(key, record);
        } else {
            let stored = record.negate();
            if !self.left_table.erase(&key, &stored) {
                panic!("join retraction for an unseen left record");
            }
            for right in self.right_table.get(&key) {
                output.push(self.joined(&record, right, false));
            }
            if self.mode == JoinMode::Left {
                let padded = self.left_padded(&record, false);
                if self.emitted_nulls.erase(&key, &padded) {
                    output.push(padded);
                }
            }
            // The last left is gone; unmatched rights become padded again.
            if self.mode == JoinMode::Right && !self.left_table.contains(&key) {
                for right in self.right_table.get(&key) {
                    let padded = self.right_padded(right, true);
                    self.emitted_nulls.insert(key.clone(), padded.copy());
                    output.push(padded);
                }
            }
        }
    }

    fn process_right(&mut self, record: Record, output: &mut Vec<Record>) {
        let key = record.get_values(&[self.right_id]);
        let positive = record.is_positive();
        if positive {
            if self.mode == JoinMode::Left && !self.right_table.contains(&key) {
                for left in self.left_table.get(&key) {
                    let padded = self.left_padded(left, false);
                    if self.emitted_nulls.erase(&key, &padded) {
                        output.push(padded);
                    }
                }
            }
            for left in self.left_table.get(&key) {
                output.push(self.joined(left, &record, true));
            }
            if self.mode == JoinMode::Right && self.left_table.get(&key).is_empty() {
                let padded = self.right_padded(&record, true);
                self.emitted_nulls.insert(key.clone(), padded.copy());
                output.push(padded);
            }
            self.right_table.insert(key, record);
        } else {
            let stored = record.negate();
            if !self.right_table.erase(&key, &stored) {
                panic!("join retraction for an unseen right record");
            }
            for left in self.left_table.get(&key) {
                output.push(self.joined(left, &record, false));
            }
            if self.mode == JoinMode::Right {
                let padded = self.right_padded(&record, false);
                if self.emitted_nulls.erase(&key, &padded) {
                    output.push(padded);
                }
            }
            if self.mode == JoinMode::Left && !self.right_table.contains(&key) {
                for left in self.left_table.get(&key) {
                    let padded = self.left_padded(left, true);
                    self.emitted_nulls.insert(key.clone(), padded.copy());
                    output.push(padded);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::ColumnType;

    fn users() -> SchemaRef {
        SchemaRef::new(
            vec!["id".into(), "name".into()],
            vec![ColumnType::Int, ColumnType::Text],
            vec![0],
        )
    }

    fn notes() -> SchemaRef {
        SchemaRef::new(
            vec!["nid".into(), "author".into()],
            vec![ColumnType::Int, ColumnType::Int],
            vec![0],
        )
    }

    fn user(id: i64, name: &str, positive: bool) -> Record {
        Record::from_values(
            users(),
            positive,
            vec![Value::Int(id), Value::Text(name.into())],
        )
    }

    fn note(nid: i64, author: i64, positive: bool) -> Record {
        Record::from_values(notes(), positive, vec![Value::Int(nid), Value::Int(author)])
    }

    fn join(mode: JoinMode) -> EquiJoinOperator {
        // users.id = notes.author
        let mut op = EquiJoinOperator::new(0, 1, mode);
        op.compute_schema(&users(), &notes());
        op
    }

    #[test]
    fn inner_join_emits_matches() {
        let mut op = join(JoinMode::Inner);
        assert!(op.process(0, vec![user(1, "a", true)]).is_empty());
        let out = op.process(1, vec![note(10, 1, true), note(11, 2, true)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_value(0), Value::Int(1));
        assert_eq!(out[0].get_value(2), Value::Int(10));
    }

    #[test]
    fn retract_removes_joined_row() {
        let mut op = join(JoinMode::Inner);
        op.process(0, vec![user(1, "a", true)]);
        op.process(1, vec![note(10, 1, true)]);
        let out = op.process(0, vec![user(1, "a", false)]);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_positive());
    }

    #[test]
    fn left_join_pads_and_retracts_padding() {
        let mut op = join(JoinMode::Left);
        let out = op.process(0, vec![user(1, "a", true)]);
        // No match: padded row emitted.
        assert_eq!(out.len(), 1);
        assert!(out[0].is_null(2));

        // A match arrives: the padding is retracted, the join row emitted.
        let out = op.process(1, vec![note(10, 1, true)]);
        assert_eq!(out.len(), 2);
        let negative = out.iter().find(|r| !r.is_positive()).unwrap();
        assert!(negative.is_null(2));
        let positive = out.iter().find(|r| r.is_positive()).unwrap();
        assert_eq!(positive.get_value(2), Value::Int(10));
    }

    #[test]
    fn join_retract_removes_padding_companion() {
        let mut op = join(JoinMode::Left);
        op.process(0, vec![user(1, "a", true)]);
        op.process(1, vec![note(10, 1, true)]);
        // Retracting the note retracts the join row and re-pads the user.
        let out = op.process(1, vec![note(10, 1, false)]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|r| !r.is_positive() && !r.is_null(2)));
        assert!(out.iter().any(|r| r.is_positive() && r.is_null(2)));
    }

    #[test]
    fn right_join_pads_right_side() {
        let mut op = join(JoinMode::Right);
        let out = op.process(1, vec![note(10, 7, true)]);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_null(0));
        assert_eq!(out[0].get_value(2), Value::Int(10));

        let out = op.process(0, vec![user(7, "g", true)]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|r| !r.is_positive() && r.is_null(0)));
        assert!(out.iter().any(|r| r.is_positive() && !r.is_null(0)));
    }
}
