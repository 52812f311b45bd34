//! Per-column policy tags.
//!
//! A policy schema attaches to one column of a table. The compliance
//! layer instantiates it against concrete rows: rows retracted by a
//! delete carry their policies into the dataflow, and rows returned by
//! reads are serialized together with their policies so clients see
//! which rules govern each column.

pub mod engine;
pub mod policies;

pub use engine::{make_policies, serialize_policies, PolicyRegistry};
pub use policies::Policy;
