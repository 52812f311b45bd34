//! Incremental view maintenance.

pub mod graph;
pub mod key;
pub mod ops;
pub mod record;
pub mod schema;
pub mod state;
pub mod types;

pub use graph::GraphPartition;
pub use key::Key;
pub use record::Record;
pub use schema::SchemaRef;
pub use state::{DataFlow, DataFlowState};
