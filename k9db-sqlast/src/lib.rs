//! Typed SQL statement AST.
//!
//! The SQL text parser lives outside this workspace; it produces these
//! types. Everything downstream (sharding, storage, dataflow) operates on
//! this AST, never on SQL text.

pub mod error;
pub mod expression;
pub mod policy;
pub mod schema;
pub mod statements;
pub mod value;
pub mod value_mapper;

pub use error::Error;
pub use expression::{BinaryOperator, Expression};
pub use policy::{CreatePolicy, PolicyClause, PolicyCombination, PolicyExpression};
pub use schema::{
    AnonymizationRule, AnonymizationType, ColumnConstraint, ColumnDefinition, ColumnType,
    CreateTable, ForeignKeyKind,
};
pub use statements::{
    CreateIndex, CreateView, Delete, ExplainQuery, GdprOperation, GdprStatement, Insert, Replace,
    ResultColumn, Select, Statement, Update,
};
pub use value::Value;
pub use value_mapper::ValueMapper;
