//! Sharding metadata and the SQL rewriting engine.

pub mod sqlengine;
pub mod state;
pub mod types;

pub use state::SharderState;
pub use types::{Shard, ShardDescriptor, ShardingInfo, Table};
