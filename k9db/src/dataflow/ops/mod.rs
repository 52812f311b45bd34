//! Dataflow operators.
//!
//! Operators are one tagged enum with a shared surface: `process` a batch
//! of positive/negative records, `compute_schema` from input schemas,
//! `clone_op` into a fresh stateless copy for another partition, and a
//! memory estimate for diagnostics. Processing must be deterministic and
//! commute over disjoint batches up to output order.

pub mod aggregate;
pub mod equijoin;
pub mod exchange;
pub mod filter;
pub mod matview;
pub mod project;

pub use aggregate::{AggregateFunction, AggregateOperator};
pub use equijoin::{EquiJoinOperator, JoinMode};
pub use exchange::ExchangeOperator;
pub use filter::{FilterOp, FilterOperation, FilterOperator};
pub use matview::{MatViewOperator, ViewOrder};
pub use project::{ArithmeticOp, Operand, ProjectOperator, Projection};

use super::record::Record;
use super::schema::SchemaRef;

/// Any node of a dataflow graph.
pub enum Operator {
    /// Binding point between a table and the flow; emits its batch
    /// unchanged.
    Input { table: String, schema: SchemaRef },
    /// Like Input, but fed from another materialized view.
    ForwardView { view: String, schema: SchemaRef },
    /// Pass-through.
    Identity,
    /// Concatenates batches of schema-identical inputs.
    Union,
    Filter(FilterOperator),
    Project(ProjectOperator),
    Aggregate(AggregateOperator),
    EquiJoin(EquiJoinOperator),
    MatView(MatViewOperator),
    Exchange(ExchangeOperator),
}

impl Operator {
    /// Process one batch arriving from the parent at `source`, the position
    /// of the sending parent among this operator's parents.
    pub fn process(&mut self, source: usize, batch: Vec<Record>) -> Vec<Record> {
        match self {
            Operator::Input { .. }
            | Operator::ForwardView { .. }
            | Operator::Identity
            | Operator::Union => batch,
            Operator::Filter(op) => op.process(batch),
            Operator::Project(op) => op.process(batch),
            Operator::Aggregate(op) => op.process(batch),
            Operator::EquiJoin(op) => op.process(source, batch),
            Operator::MatView(op) => op.process(batch),
            Operator::Exchange(op) => op.process(batch),
        }
    }

    /// Compute the output schema from the parents' output schemas.
    /// Mismatched inputs are planner bugs and fatal.
    pub fn compute_schema(&mut self, inputs: &[SchemaRef]) -> SchemaRef {
        match self {
            Operator::Input { schema, .. } | Operator::ForwardView { schema, .. } => {
                assert!(inputs.is_empty(), "input operator with parents");
                schema.clone()
            }
            Operator::Identity => inputs[0].clone(),
            Operator::Union => {
                for input in &inputs[1..] {
                    assert_eq!(
                        input.column_names(),
                        inputs[0].column_names(),
                        "union over unequal schemas"
                    );
                    assert_eq!(input.column_types(), inputs[0].column_types());
                }
                inputs[0].clone()
            }
            Operator::Filter(op) => op.compute_schema(&inputs[0]),
            Operator::Project(op) => op.compute_schema(&inputs[0]),
            Operator::Aggregate(op) => op.compute_schema(&inputs[0]),
            Operator::EquiJoin(op) => op.compute_schema(&inputs[0], &inputs[1]),
            Operator::MatView(op) => op.compute_schema(&inputs[0]),
            Operator::Exchange(op) => op.compute_schema(&inputs[0]),
        }
    }

    /// A fresh copy with empty state, for cloning a partition.
    pub fn clone_op(&self) -> Operator {
        match self {
            Operator::Input { table, schema } => Operator::Input {
                table: table.clone(),
                schema: schema.clone(),
            },
            Operator::ForwardView { view, schema } => Operator::ForwardView {
                view: view.clone(),
                schema: schema.clone(),
            },
            Operator::Identity => Operator::Identity,
            Operator::Union => Operator::Union,
            Operator::Filter(op) => Operator::Filter(op.clone()),
            Operator::Project(op) => Operator::Project(op.clone()),
            Operator::Aggregate(op) => Operator::Aggregate(op.clone_op()),
            Operator::EquiJoin(op) => Operator::EquiJoin(op.clone_op()),
            Operator::MatView(op) => Operator::MatView(op.clone_op()),
            Operator::Exchange(op) => Operator::Exchange(op.clone_op()),
        }
    }

    /// Estimated bytes of operator state.
    pub fn size_in_memory(&self) -> u64 {
        match self {
            Operator::Aggregate(op) => op.size_in_memory(),
            Operator::EquiJoin(op) => op.size_in_memory(),
            Operator::MatView(op) => op.size_in_memory(),
            _ => 0,
        }
    }

    pub fn debug_string(&self) -> String {
        match self {
            Operator::Input { table, .. } => format!("input({})", table),
            Operator::ForwardView { view, .. } => format!("forward_view({})", view),
            Operator::Identity => "identity".into(),
            Operator::Union => "union".into(),
            Operator::Filter(_) => "filter".into(),
            Operator::Project(_) => "project".into(),
            Operator::Aggregate(op) => op.debug_string(),
            Operator::EquiJoin(op) => op.debug_string(),
            Operator::MatView(_) => "matview".into(),
            Operator::Exchange(_) => "exchange".into(),
        }
    }

    pub fn is_matview(&self) -> bool {
        matches!(self, Operator::MatView(_))
    }
}

/// Deep-copy a batch for broadcasting to several children.
pub fn copy_batch(batch: &[Record]) -> Vec<Record> {
    batch.iter().map(|r| r.copy()).collect()
}
