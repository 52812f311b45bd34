//! Shared dataflow type aliases.

/// Index of an operator within a graph partition.
pub type NodeIndex = usize;

/// Index of a partition within a dataflow graph.
pub type PartitionIndex = usize;

/// Index of a column within a schema.
pub type ColumnId = usize;

pub const UNDEFINED_NODE_INDEX: NodeIndex = usize::MAX;
