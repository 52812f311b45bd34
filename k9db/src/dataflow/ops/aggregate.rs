//! Group-by aggregate operator.
//!
//! Keeps per-group running state and emits only deltas: when a group's
//! value changes, a negative record for the old value and a positive for
//! the new one. A group whose count reaches zero is erased. Retracting
//! below zero under unsigned semantics means an upstream invariant broke
//! and is fatal.

use fnv::FnvHashMap;
use k9db_sqlast::{ColumnType, Value};

use crate::dataflow::key::Key;
use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::dataflow::types::ColumnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    /// Group-by with no aggregate column (DISTINCT).
    NoAggregate,
}

/// Per-group running state.
#[derive(Debug, Clone)]
struct GroupState {
    /// The emitted value: count, sum, or current average.
    value: Value,
    /// AVG only: the running sum.
    running_sum: Value,
    /// COUNT/AVG/NO_AGGREGATE: the number of contributing rows.
    count: u64,
}

pub struct AggregateOperator {
    group_columns: Vec<ColumnId>,
    function: AggregateFunction,
    aggregate_column: ColumnId,
    aggregate_column_name: String,
    aggregate_type: ColumnType,
    output_schema: Option<SchemaRef>,
    state: FnvHashMap<Key, GroupState>,
}

impl AggregateOperator {
    pub fn new(
        group_columns: Vec<ColumnId>,
        function: AggregateFunction,
        aggregate_column: ColumnId,
    ) -> AggregateOperator {
        AggregateOperator {
            group_columns,
            function,
            aggregate_column,
            aggregate_column_name: String::new(),
            aggregate_type: ColumnType::Uint,
            output_schema: None,
            state: FnvHashMap::default(),
        }
    }

    pub fn with_column_name(mut self, name: impl Into<String>) -> AggregateOperator {
        self.aggregate_column_name = name.into();
        self
    }

    pub fn group_columns(&self) -> &[ColumnId] {
        &self.group_columns
    }

    pub fn clone_op(&self) -> AggregateOperator {
        AggregateOperator {
            group_columns: self.group_columns.clone(),
            function: self.function,
            aggregate_column: self.aggregate_column,
            aggregate_column_name: self.aggregate_column_name.clone(),
            aggregate_type: self.aggregate_type,
            output_schema: self.output_schema.clone(),
            state: FnvHashMap::default(),
        }
    }

    pub fn debug_string(&self) -> String {
        format!("aggregate({:?})", self.function)
    }

    pub fn size_in_memory(&self) -> u64 {
        self.state.len() as u64 * 24
    }

    pub fn compute_schema(&mut self, input: &SchemaRef) -> SchemaRef {
        match self.function {
            AggregateFunction::Count => {
                if self.aggregate_column_name.is_empty() {
                    self.aggregate_column_name = "Count".into();
                }
                self.aggregate_type = ColumnType::Uint;
            }
            AggregateFunction::Sum | AggregateFunction::Avg => {
                if self.aggregate_column_name.is_empty() {
                    self.aggregate_column_name = match self.function {
                        AggregateFunction::Sum => "Sum".into(),
                        _ => "Avg".into(),
                    };
                }
                self.aggregate_type = input.type_of(self.aggregate_column);
                assert!(
                    matches!(self.aggregate_type, ColumnType::Uint | ColumnType::Int),
                    "cannot aggregate over {}",
                    self.aggregate_type
                );
            }
            AggregateFunction::NoAggregate => {}
        }

        let mut names: Vec<String> = self
            .group_columns
            .iter()
            .map(|c| input.name_of(*c).to_string())
            .collect();
        let mut types: Vec<ColumnType> =
            self.group_columns.iter().map(|c| input.type_of(*c)).collect();
        if self.function != AggregateFunction::NoAggregate {
            names.push(self.aggregate_column_name.clone());
            types.push(self.aggregate_type);
        }
        // Grouped columns uniquely identify an output row.
        let keys = (0..self.group_columns.len()).collect();
        let schema = SchemaRef::new(names, types, keys);
        self.output_schema = Some(schema.clone());
        schema
    }

    fn emit(&self, key: &Key, aggregate: Option<&Value>, positive: bool) -> Record {
        let schema = self.output_schema.as_ref().expect("schema not computed");
        let mut record = Record::new(schema.clone(), positive);
        for (i, value) in key.values().iter().enumerate() {
            record.set_value(value.clone(), i);
        }
        if let Some(aggregate) = aggregate {
            record.set_value(aggregate.clone(), schema.size() - 1);
        }
        record
    }

    pub fn process(&mut self, batch: Vec<Record>) -> Vec<Record> {
        let function = self.function;
        let column = self.aggregate_column;
        let column_type = self.aggregate_type;

        // The value each touched group had before this batch; None for
        // groups born in this batch.
        let mut old_values: FnvHashMap<Key, Option<Value>> = FnvHashMap::default();

        for record in &batch {
            let key = record.get_values(&self.group_columns);
            if record.is_positive() {
                if let Some(state) = self.state.get_mut(&key) {
                    old_values
                        .entry(key.clone())
                        .or_insert_with(|| Some(state.value.clone()));
                    apply_add(function, column, column_type, state, record);
                } else {
                    old_values.entry(key.clone()).or_insert(None);
                    let mut state = GroupState {
                        value: initial_value(function, column_type),
                        running_sum: zero(column_type),
                        count: 0,
                    };
                    apply_add(function, column, column_type, &mut state, record);
                    self.state.insert(key, state);
                }
            } else {
                let mut state = self
                    .state
                    .remove(&key)
                    .unwrap_or_else(|| panic!("negative record for a group never seen"));
                old_values
                    .entry(key.clone())
                    .or_insert_with(|| Some(state.value.clone()));
                apply_remove(function, column, column_type, &mut state, record);
                if state.count > 0 {
                    self.state.insert(key, state);
                }
            }
        }

        // Emit deltas for groups whose visible value changed.
        let mut output = Vec::new();
        for (key, old_value) in old_values {
            let new_value = self.state.get(&key).map(|s| s.value.clone());
            match (old_value, new_value) {
                (None, Some(new)) => {
                    output.push(self.emit(&key, self.aggregate_of(&new), true));
                }
                (Some(old), None) => {
                    output.push(self.emit(&key, self.aggregate_of(&old), false));
                }
                (Some(old), Some(new)) => {
                    if old != new {
                        output.push(self.emit(&key, self.aggregate_of(&old), false));
                        output.push(self.emit(&key, self.aggregate_of(&new), true));
                    }
                }
                (None, None) => {}
            }
        }
        output
    }

    fn aggregate_of<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        match self.function {
            AggregateFunction::NoAggregate => None,
            _ => Some(value),
        }
    }
}

fn zero(column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Int => Value::Int(0),
        _ => Value::Uint(0),
    }
}

fn initial_value(function: AggregateFunction, column_type: ColumnType) -> Value {
    match function {
        AggregateFunction::Sum => zero(column_type),
        _ => Value::Uint(0),
    }
}

fn apply_add(
    function: AggregateFunction,
    column: ColumnId,
    column_type: ColumnType,
    state: &mut GroupState,
    record: &Record,
) {
    state.count += 1;
    match function {
        AggregateFunction::Count | AggregateFunction::NoAggregate => {
            state.value = Value::Uint(state.count);
        }
        AggregateFunction::Sum => {
            state.value = add_values(&state.value, &record.get_value(column), column_type);
        }
        AggregateFunction::Avg => {
            state.running_sum =
                add_values(&state.running_sum, &record.get_value(column), column_type);
            state.value = divide(&state.running_sum, state.count, column_type);
        }
    }
}

fn apply_remove(
    function: AggregateFunction,
    column: ColumnId,
    column_type: ColumnType,
    state: &mut GroupState,
    record: &Record,
) {
    assert!(state.count > 0, "retraction for an empty group");
    state.count -= 1;
    match function {
        AggregateFunction::Count | AggregateFunction::NoAggregate => {
            state.value = Value::Uint(state.count);
        }
        AggregateFunction::Sum => {
            state.value = subtract_values(&state.value, &record.get_value(column), column_type);
        }
        AggregateFunction::Avg => {
            state.running_sum =
                subtract_values(&state.running_sum, &record.get_value(column), column_type);
            if state.count > 0 {
                state.value = divide(&state.running_sum, state.count, column_type);
            }
        }
    }
}

fn add_values(left: &Value, right: &Value, column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Uint => Value::Uint(left.as_uint() + right.as_uint()),
        ColumnType::Int => Value::Int(left.as_int() + right.as_int()),
        _ => panic!("aggregate over non-integer type"),
    }
}

fn subtract_values(left: &Value, right: &Value, column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Uint => {
            let (l, r) = (left.as_uint(), right.as_uint());
            // Wrap-around under unsigned retraction means upstream emitted
            // an impossible delta.
            assert!(l >= r, "unsigned aggregate would go negative");
            Value::Uint(l - r)
        }
        ColumnType::Int => Value::Int(left.as_int() - right.as_int()),
        _ => panic!("aggregate over non-integer type"),
    }
}

fn divide(sum: &Value, count: u64, column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Uint => Value::Uint(sum.as_uint() / count),
        ColumnType::Int => Value::Int(sum.as_int() / count as i64),
        _ => panic!("aggregate over non-integer type"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> SchemaRef {
        SchemaRef::new(
            vec!["dept".into(), "salary".into()],
            vec![ColumnType::Text, ColumnType::Uint],
            vec![0],
        )
    }

    fn row(dept: &str, salary: u64, positive: bool) -> Record {
        Record::from_values(
            schema(),
            positive,
            vec![Value::Text(dept.into()), Value::Uint(salary)],
        )
    }

    fn sum_operator() -> AggregateOperator {
        let mut op = AggregateOperator::new(vec![0], AggregateFunction::Sum, 1);
        op.compute_schema(&schema());
        op
    }

    #[test]
    fn sum_emits_delta_pairs() {
        let mut op = sum_operator();
        let out = op.process(vec![row("a", 10, true), row("a", 5, true)]);
        // One batch, one final value: only the positive for 15.
        assert_eq!(out.len(), 1);
        assert!(out[0].is_positive());
        assert_eq!(out[0].get_value(1), Value::Uint(15));

        let out = op.process(vec![row("a", 3, true)]);
        assert_eq!(out.len(), 2);
        let negative = out.iter().find(|r| !r.is_positive()).unwrap();
        let positive = out.iter().find(|r| r.is_positive()).unwrap();
        assert_eq!(negative.get_value(1), Value::Uint(15));
        assert_eq!(positive.get_value(1), Value::Uint(18));
    }

    #[test]
    fn count_group_erased_at_zero() {
        let mut op = AggregateOperator::new(vec![0], AggregateFunction::Count, 0);
        op.compute_schema(&schema());
        op.process(vec![row("a", 1, true)]);
        let out = op.process(vec![row("a", 1, false)]);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_positive());
        assert_eq!(out[0].get_value(1), Value::Uint(1));
        assert!(op.state.is_empty());
    }

    #[test]
    fn exact_retraction_returns_to_empty() {
        let mut op = sum_operator();
        let positives = vec![row("a", 10, true), row("b", 7, true), row("a", 2, true)];
        let negatives = vec![row("a", 10, false), row("b", 7, false), row("a", 2, false)];
        op.process(positives);
        op.process(negatives);
        assert!(op.state.is_empty());
    }

    #[test]
    fn average_tracks_sum_and_count() {
        let mut op = AggregateOperator::new(vec![0], AggregateFunction::Avg, 1);
        op.compute_schema(&schema());
        let out = op.process(vec![row("a", 10, true), row("a", 20, true)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_value(1), Value::Uint(15));

        let out = op.process(vec![row("a", 10, false)]);
        let positive = out.iter().find(|r| r.is_positive()).unwrap();
        assert_eq!(positive.get_value(1), Value::Uint(20));
    }

    #[test]
    fn unchanged_group_emits_nothing() {
        let mut op = sum_operator();
        op.process(vec![row("a", 10, true)]);
        // +5 then -5 in one batch: value unchanged, no output.
        let out = op.process(vec![row("a", 5, true), row("a", 5, false)]);
        assert!(out.is_empty());
    }

    #[test]
    #[should_panic]
    fn unsigned_underflow_is_fatal() {
        let mut op = sum_operator();
        op.process(vec![row("a", 5, true)]);
        // Retracting 6 from 5 would wrap around.
        op.process(vec![row("a", 6, false)]);
    }
}
