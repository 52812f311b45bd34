//! SELECT: direct shard lookup when the pk pins the row, index-planned
//! storage lookup otherwise, view lookup for materialized views.

use k9db_sqlast::{Select, Value, ValueMapper};

use crate::connection::State;
use crate::dataflow::key::Key;
use crate::error::{Error, Result};
use crate::shards::types::ShardingInfo;
use crate::sql::result::{KeyPair, SqlResult, SqlResultSet};
use crate::sql::rocks::filter;
use crate::sql::rocks::project::Projection;
use crate::util::ShardName;

pub struct SelectContext<'a> {
    stmt: &'a Select,
    table_name: String,
    state: &'a State,
}

impl<'a> SelectContext<'a> {
    pub fn new(stmt: &'a Select, state: &'a State) -> SelectContext<'a> {
        SelectContext {
            table_name: stmt.table_name.clone(),
            stmt,
            state,
        }
    }

    /// When the pk is fully constrained and the table has at most one way
    /// of being owned, the `(shard, pk)` pairs are computable without the
    /// planner: either the owner column is also constrained, or the global
    /// PK index knows the shards.
    fn find_direct_keys(
        &self,
        mapper: &mut ValueMapper,
        session: &crate::sql::rocks::RocksdbSession,
    ) -> Result<Option<Vec<KeyPair>>> {
        if mapper.is_empty() {
            return Ok(None);
        }
        let table = self.state.sharder().table(&self.table_name);
        if table.owners.len() > 1 {
            return Ok(None);
        }
        let pk = table.schema.keys()[0];
        if !mapper.has_values(pk) {
            return Ok(None);
        }

        let pk_values = mapper.release_values(pk);

        // Unowned table: everything lives in the default shard.
        if table.owners.is_empty() {
            return Ok(Some(
                pk_values
                    .into_iter()
                    .map(|pk| (ShardName::default_shard(), pk))
                    .collect(),
            ));
        }

        let desc = &table.owners[0];
        if matches!(desc.info, ShardingInfo::Direct(_)) && mapper.has_values(desc.column_index()) {
            // Owner column given in the query: cross product of shards
            // and pks.
            let users = mapper.release_values(desc.column_index());
            let mut keys = Vec::new();
            for user in users {
                let shard = ShardName::new(&desc.shard_kind, user.as_unquoted_string());
                for pk_value in &pk_values {
                    keys.push((shard.clone(), pk_value.clone()));
                }
            }
            return Ok(Some(keys));
        }

        // The global PK index maps each pk to its shards.
        let mut keys = Vec::new();
        for pk_value in pk_values {
            for shard in session.find_shards(&self.table_name, pk, &pk_value)? {
                keys.push((shard, pk_value.clone()));
            }
        }
        Ok(Some(keys))
    }

    pub fn exec_within_transaction(
        &self,
        session: &crate::sql::rocks::RocksdbSession,
    ) -> Result<SqlResult> {
        let schema = self.state.sharder().table(&self.table_name).schema.clone();
        let mut mapper = ValueMapper::new(schema.column_names());
        if let Some(clause) = &self.stmt.where_clause {
            mapper.visit(clause);
        }

        if let Some(keys) = self.find_direct_keys(&mut mapper, session)? {
            let pk = schema.keys()[0];
            let mut records = session.get_direct(&self.table_name, pk, &keys)?;
            if let Some(clause) = &self.stmt.where_clause {
                records.retain(|r| filter::matches(clause, r));
            }
            let projection = Projection::compile(&schema, &self.stmt.projection);
            let records: Vec<_> = records
                .into_iter()
                .skip(self.stmt.offset)
                .take(self.stmt.limit.unwrap_or(usize::MAX))
                .map(|r| projection.apply(&r))
                .collect();
            let out_schema = if projection.is_identity() {
                schema
            } else {
                projection.schema().clone()
            };
            return Ok(SqlResult::ResultSets(vec![SqlResultSet::new(
                out_schema, records,
            )]));
        }

        let result = session.execute_select(self.stmt)?;
        Ok(SqlResult::ResultSets(vec![result]))
    }

    pub fn exec(self) -> Result<SqlResult> {
        if !self.state.sharder().table_exists(&self.table_name) {
            return Err(Error::UnknownTable(self.table_name.clone()));
        }
        let mut session = self.state.database().session();
        session.begin_transaction(false);
        let result = self.exec_within_transaction(&session);
        session.rollback_transaction()?;
        result
    }
}

/// SELECT against a materialized view: an equality or IN constraint on the
/// view's key columns becomes a keyed lookup; anything else reads the
/// whole view.
pub fn select_view(stmt: &Select, state: &State) -> Result<SqlResult> {
    let flow = state.dataflow().flow(&stmt.table_name)?;
    let schema = flow.output_schema();

    let mut mapper = ValueMapper::new(schema.column_names());
    if let Some(clause) = &stmt.where_clause {
        mapper.visit(clause);
    }

    let matview_key = {
        // Keys of the view's output schema.
        let keys = schema.keys().to_vec();
        let constrained = !keys.is_empty() && keys.iter().all(|k| mapper.has_values(*k));
        constrained.then_some(keys)
    };

    let mut records = match matview_key {
        Some(keys) => {
            // Cross product of the per-column constraints.
            let mut key_sets: Vec<Vec<Value>> = vec![Vec::new()];
            for column in &keys {
                let values = mapper.release_values(*column);
                let mut next = Vec::new();
                for prefix in &key_sets {
                    for value in &values {
                        let mut combined = prefix.clone();
                        combined.push(value.clone());
                        next.push(combined);
                    }
                }
                key_sets = next;
            }
            let mut records = Vec::new();
            for values in key_sets {
                records.extend(flow.lookup(&Key::new(values), stmt.limit, stmt.offset));
            }
            records
        }
        None => flow.all(stmt.limit, stmt.offset),
    };

    if let Some(clause) = &stmt.where_clause {
        records.retain(|r| filter::matches(clause, r));
    }
    Ok(SqlResult::ResultSets(vec![SqlResultSet::new(
        schema, records,
    )]))
}
