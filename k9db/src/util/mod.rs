//! Small shared helpers.

pub mod shard_name;

pub use shard_name::{ShardName, DEFAULT_SHARD};
