//! GDPR GET and FORGET.
//!
//! Both walk outward from `(shard kind, user id)`: every owned table is
//! read straight out of the user's shard, then access-dependent tables are
//! pulled in recursively. Collected rows are grouped by the ownership or
//! access path that reached them, because anonymization rules apply per
//! path.

use std::collections::{HashMap, HashSet};

use k9db_sqlast::{
    AnonymizationType, Delete, Expression, GdprStatement, Select, Update, Value,
};

use super::delete::DeleteContext;
use super::update::UpdateContext;
use crate::connection::State;
use crate::ctx::ComplianceTransaction;
use crate::dataflow::record::Record;
use crate::error::Result;
use crate::shards::types::ShardingInfo;
use crate::sql::result::{SqlResult, SqlResultSet};
use crate::sql::rocks::RocksdbSession;
use crate::util::ShardName;

/// The path labels a record was reached along.
type Paths = HashSet<String>;
/// table -> pk string -> (record, paths).
type WorkingSet = HashMap<String, HashMap<String, (Record, Paths)>>;
/// table -> groups of records sharing a path set.
type GroupedRecords = HashMap<String, Vec<(Paths, Vec<Record>)>>;

struct GdprContext<'a> {
    shard_kind: String,
    user_id: Value,
    shard: ShardName,
    state: &'a State,
    records: WorkingSet,
}

impl<'a> GdprContext<'a> {
    fn new(stmt: &GdprStatement, state: &'a State) -> GdprContext<'a> {
        let user_id_str = stmt.user_id.as_unquoted_string();
        GdprContext {
            shard: ShardName::new(&stmt.shard_kind, &user_id_str),
            shard_kind: stmt.shard_kind.clone(),
            user_id: stmt.user_id.clone(),
            state,
            records: WorkingSet::new(),
        }
    }

    /// Is any row matching `column IN values` of `table_name` owned by
    /// this user's shard?
    fn owned_by(
        &self,
        session: &RocksdbSession,
        table_name: &str,
        column: usize,
        values: &[Value],
    ) -> Result<bool> {
        for value in values {
            if session
                .find_shards(table_name, column, value)?
                .contains(&self.shard)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The columns along which this record is owned by the user.
    fn owned_through(
        &self,
        session: &RocksdbSession,
        table_name: &str,
        record: &Record,
    ) -> Result<Paths> {
        let table = self.state.sharder().table(table_name);
        let relevant: Vec<_> = table
            .owners
            .iter()
            .filter(|d| d.shard_kind == self.shard_kind)
            .collect();

        let label = |desc: &crate::shards::types::ShardDescriptor| match &desc.info {
            ShardingInfo::Variable(_) => {
                format!("{}({})", desc.next_table(), desc.upcolumn())
            }
            _ => desc.column().clone(),
        };

        let mut paths = Paths::new();
        if relevant.len() == 1 {
            paths.insert(label(relevant[0]));
            return Ok(paths);
        }
        for desc in relevant {
            let value = record.get_value(desc.column_index());
            if value.is_null() {
                continue;
            }
            if self.owned_by(
                session,
                desc.next_table(),
                desc.upcolumn_index(),
                std::slice::from_ref(&value),
            )? {
                paths.insert(label(desc));
            }
        }
        Ok(paths)
    }

    fn add_owned_records(
        &mut self,
        session: &RocksdbSession,
        table_name: &str,
        records: &[Record],
    ) -> Result<()> {
        let pk_column = self.state.sharder().table(table_name).schema.keys()[0];
        for record in records {
            let paths = self.owned_through(session, table_name, record)?;
            let pk = record.get_value(pk_column).as_unquoted_string();
            let map = self.records.entry(table_name.to_string()).or_default();
            match map.get_mut(&pk) {
                Some((_, existing)) => existing.extend(paths),
                None => {
                    map.insert(pk, (record.copy(), paths));
                }
            }
        }
        Ok(())
    }

    fn add_accessed_records(&mut self, table_name: &str, along: &str, records: &[Record]) {
        let pk_column = self.state.sharder().table(table_name).schema.keys()[0];
        for record in records {
            let pk = record.get_value(pk_column).as_unquoted_string();
            let map = self.records.entry(table_name.to_string()).or_default();
            match map.get_mut(&pk) {
                Some((_, existing)) => {
                    existing.insert(along.to_string());
                }
                None => {
                    let mut paths = Paths::new();
                    paths.insert(along.to_string());
                    map.insert(pk, (record.copy(), paths));
                }
            }
        }
    }

    /// Build the working set: all owned rows plus everything reachable
    /// through access-dependent edges.
    fn recurse_over_dependents(&mut self, session: &RocksdbSession) -> Result<()> {
        let owned_tables: Vec<String> = self
            .state
            .sharder()
            .shard(&self.shard_kind)
            .owned_tables
            .iter()
            .cloned()
            .collect();
        for table_name in owned_tables {
            let result = session.get_shard(&table_name, &self.shard)?;
            let rows: Vec<Record> = result.into_rows();
            self.add_owned_records(session, &table_name, &rows)?;
            self.recurse_over_access_dependents(session, &table_name, rows)?;
        }
        Ok(())
    }

    fn recurse_over_access_dependents(
        &mut self,
        session: &RocksdbSession,
        table_name: &str,
        records: Vec<Record>,
    ) -> Result<()> {
        let edges: Vec<_> = self
            .state
            .sharder()
            .table(table_name)
            .access_dependents
            .iter()
            .filter(|(_, desc)| desc.shard_kind == self.shard_kind)
            .cloned()
            .collect();
        for (next_table, desc) in edges {
            let values: Vec<Value> = records
                .iter()
                .map(|r| r.get_value(desc.upcolumn_index()))
                .filter(|v| !v.is_null())
                .collect();
            if values.is_empty() {
                continue;
            }
            let select = Select::new(next_table.clone())
                .filter(Expression::within(desc.column().clone(), values));
            let result = session.execute_select(&select)?;
            let rows = result.into_rows();

            let along = match &desc.info {
                ShardingInfo::Variable(_) => {
                    format!("{}({})", desc.next_table(), desc.upcolumn())
                }
                _ => desc.column().clone(),
            };
            self.add_accessed_records(&next_table, &along, &rows);
            self.recurse_over_access_dependents(session, &next_table, rows)?;
        }
        Ok(())
    }

    /// Reorganize the working set into groups of records sharing the same
    /// path set, per table.
    fn group_by_paths(&mut self) -> GroupedRecords {
        let mut result = GroupedRecords::new();
        for (table_name, map) in std::mem::take(&mut self.records) {
            let groups = result.entry(table_name).or_default();
            let mut by_label: HashMap<String, usize> = HashMap::new();
            for (_, (record, paths)) in map {
                let mut sorted: Vec<&String> = paths.iter().collect();
                sorted.sort();
                let label = sorted
                    .into_iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                match by_label.get(&label) {
                    Some(position) => groups[*position].1.push(record),
                    None => {
                        by_label.insert(label, groups.len());
                        groups.push((paths, vec![record]));
                    }
                }
            }
        }
        result
    }
}

pub struct GdprGetContext<'a> {
    inner: GdprContext<'a>,
}

impl<'a> GdprGetContext<'a> {
    pub fn new(stmt: &GdprStatement, state: &'a State) -> GdprGetContext<'a> {
        GdprGetContext {
            inner: GdprContext::new(stmt, state),
        }
    }

    /// Read-only: collects the user's data, applies GET-time anonymization
    /// per path group, and returns one result set per table.
    pub fn exec(mut self) -> Result<SqlResult> {
        if !self
            .inner
            .state
            .sharder()
            .shard_kind_exists(&self.inner.shard_kind)
        {
            return Err(crate::error::Error::invalid(
                "GDPR",
                &self.inner.shard_kind,
                None,
                "unknown shard kind",
            ));
        }
        let mut session = self.inner.state.database().session();
        session.begin_transaction(false);

        let result = (|| -> Result<SqlResult> {
            self.inner.recurse_over_dependents(&session)?;
            let working_set = self.inner.group_by_paths();

            let mut sets = Vec::new();
            for (table_name, groups) in working_set {
                let table = self.inner.state.sharder().table(&table_name);
                let schema = table.schema.clone();
                let rules = table.anonymization_rules().to_vec();
                let mut output = Vec::new();
                for (paths, records) in groups {
                    if records.is_empty() || paths.is_empty() {
                        continue;
                    }
                    let mut withhold = false;
                    let mut anonymize: HashSet<usize> = HashSet::new();
                    for rule in &rules {
                        if rule.rule_type != AnonymizationType::Get
                            || !paths.contains(&rule.data_subject)
                        {
                            continue;
                        }
                        if rule.delete_row() {
                            withhold = true;
                            break;
                        }
                        for column in &rule.anonymize_columns {
                            anonymize.insert(schema.index_of(column).unwrap_or_else(|| {
                                panic!("anonymization rule names unknown column {}", column)
                            }));
                        }
                    }
                    if withhold {
                        continue;
                    }
                    for mut record in records {
                        for column in &anonymize {
                            record.set_null(*column);
                        }
                        output.push(record);
                    }
                }
                crate::policy::make_policies(
                    self.inner.state.policies(),
                    &table_name,
                    &mut output,
                );
                sets.push(SqlResultSet::new(schema, output));
            }
            Ok(SqlResult::ResultSets(sets))
        })();

        // Nothing to commit; read only.
        session.rollback_transaction()?;
        result
    }
}

pub struct GdprForgetContext<'a> {
    inner: GdprContext<'a>,
    ctx: &'a mut ComplianceTransaction,
    /// Dataflow deltas per table.
    updates: HashMap<String, Vec<Record>>,
    /// Pks already physically deleted, per table.
    deleted: HashMap<String, HashSet<String>>,
    count: usize,
}

impl<'a> GdprForgetContext<'a> {
    pub fn new(
        stmt: &GdprStatement,
        state: &'a State,
        ctx: &'a mut ComplianceTransaction,
    ) -> GdprForgetContext<'a> {
        GdprForgetContext {
            inner: GdprContext::new(stmt, state),
            ctx,
            updates: HashMap::new(),
            deleted: HashMap::new(),
            count: 0,
        }
    }

    /// Wipe the user's shard. A deleted row is only a retraction for the
    /// dataflow when no other shard still holds a copy.
    fn delete_owned_records(&mut self, session: &RocksdbSession) -> Result<()> {
        let owned_tables: Vec<String> = self
            .inner
            .state
            .sharder()
            .shard(&self.inner.shard_kind)
            .owned_tables
            .iter()
            .cloned()
            .collect();
        for table_name in owned_tables {
            let result = session.delete_shard(&table_name, &self.inner.shard)?;
            self.count += result.size();
            let records = result.into_rows();

            let pk_column = self.inner.state.sharder().table(&table_name).schema.keys()[0];
            let pks: Vec<Value> = records.iter().map(|r| r.get_value(pk_column)).collect();
            let counts = session.count_shards(&table_name, &pks)?;
            for ((record, pk), remaining) in records.into_iter().zip(pks).zip(counts) {
                if remaining == 0 {
                    self.deleted
                        .entry(table_name.clone())
                        .or_default()
                        .insert(pk.as_unquoted_string());
                    self.updates.entry(table_name.clone()).or_default().push(record);
                }
            }
        }
        Ok(())
    }

    /// Apply DEL-time rules to reachable rows living outside the shard:
    /// delete whole rows or nullify columns depending on the path.
    fn anonymize_records(&mut self, session: &RocksdbSession) -> Result<()> {
        let working_set = self.inner.group_by_paths();
        for (table_name, groups) in working_set {
            let table = self.inner.state.sharder().table(&table_name);
            let schema = table.schema.clone();
            let rules = table.anonymization_rules().to_vec();
            let pk_column = schema.keys()[0];
            let pk_name = schema.name_of(pk_column).to_string();

            for (paths, records) in groups {
                if records.is_empty() || paths.is_empty() {
                    continue;
                }
                let mut delete_row = false;
                let mut anonymize: HashSet<String> = HashSet::new();
                for rule in &rules {
                    if rule.rule_type != AnonymizationType::Del
                        || !paths.contains(&rule.data_subject)
                    {
                        continue;
                    }
                    if rule.delete_row() {
                        delete_row = true;
                        break;
                    }
                    anonymize.extend(rule.anonymize_columns.iter().cloned());
                }

                // Rows already gone with the shard are out of scope.
                let deleted = self.deleted.entry(table_name.clone()).or_default();
                let pks: Vec<Value> = records
                    .iter()
                    .map(|r| r.get_value(pk_column))
                    .filter(|pk| !deleted.contains(&pk.as_unquoted_string()))
                    .collect();
                if pks.is_empty() {
                    continue;
                }

                if delete_row {
                    let delete = Delete::new(table_name.clone())
                        .filter(Expression::within(pk_name.clone(), pks));
                    let context =
                        DeleteContext::new(&delete, self.inner.state, self.ctx);
                    let (count, rows) = context.delete_anonymize(session)?;
                    self.count += count;
                    self.updates.entry(table_name.clone()).or_default().extend(rows);
                } else if !anonymize.is_empty() {
                    let mut update = Update::new(table_name.clone());
                    for column in &anonymize {
                        update = update.set(column, Expression::Literal(Value::Null));
                    }
                    let update = update.filter(Expression::within(pk_name.clone(), pks));
                    let context =
                        UpdateContext::new(&update, self.inner.state, self.ctx);
                    let (count, rows) = context.update_anonymize(session)?;
                    self.count += count;
                    self.updates.entry(table_name.clone()).or_default().extend(rows);
                }
            }
        }
        Ok(())
    }

    pub fn exec(mut self) -> Result<SqlResult> {
        if !self
            .inner
            .state
            .sharder()
            .shard_kind_exists(&self.inner.shard_kind)
        {
            return Err(crate::error::Error::invalid(
                "GDPR",
                &self.inner.shard_kind,
                None,
                "unknown shard kind",
            ));
        }
        let mut session = self.inner.state.database().session();
        session.begin_transaction(true);
        self.ctx.add_checkpoint();

        let result = (|| -> Result<()> {
            self.inner.recurse_over_dependents(&session)?;
            self.delete_owned_records(&session)?;
            self.anonymize_records(&session)?;
            Ok(())
        })();

        if let Err(error) = result {
            session.rollback_transaction()?;
            self.ctx.rollback_checkpoint();
            return Err(error);
        }
        if let Err(error) = session.commit_transaction() {
            self.ctx.rollback_checkpoint();
            return Err(error);
        }
        self.ctx.commit_checkpoint();

        // The subject is gone: destroy their key material and drop the
        // shard count.
        self.inner
            .state
            .database()
            .forget_user(&self.inner.user_id.as_unquoted_string());
        self.inner
            .state
            .sharder()
            .decrement_users(&self.inner.shard_kind, 1);

        for (table_name, records) in self.updates {
            self.inner.state.dataflow().process_records(&table_name, records);
        }
        Ok(SqlResult::Update(self.count))
    }
}
