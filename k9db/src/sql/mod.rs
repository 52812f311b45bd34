//! Storage engine.

pub mod result;
pub mod rocks;

pub use result::{KeyPair, SqlDeleteSet, SqlResult, SqlResultSet, SqlUpdateSet};
