//! EXPLAIN: preview the physical actions of a statement without running
//! it. One output row per shard write or removal, index touch, or view
//! update. UPDATE and REPLACE are previewed as their delete half followed
//! by their insert half, mirroring how the engine executes them when
//! sharding is affected.

use k9db_sqlast::{ColumnType, Expression, Statement, Value, ValueMapper};

use crate::connection::State;
use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::error::{Error, Result};
use crate::shards::types::ShardingInfo;
use crate::sql::result::{SqlResult, SqlResultSet};

pub struct ExplainContext<'a> {
    state: &'a State,
    lines: Vec<(String, String)>,
}

impl<'a> ExplainContext<'a> {
    pub fn new(state: &'a State) -> ExplainContext<'a> {
        ExplainContext {
            state,
            lines: Vec::new(),
        }
    }

    fn add(&mut self, action: impl Into<String>, target: impl Into<String>) {
        self.lines.push((action.into(), target.into()));
    }

    fn index_updates(&mut self, table_name: &str) {
        for index in self.state.database().index_descriptions(table_name) {
            self.add("INDEX UPDATE", format!("{} ON {}", table_name, index));
        }
    }

    /// The index the WHERE clause of a statement against `table_name`
    /// would be answered with.
    fn lookup_index(&self, table_name: &str, clause: Option<&Expression>) -> String {
        let schema = self.state.sharder().table(table_name).schema.clone();
        let mut mapper = ValueMapper::new(schema.column_names());
        if let Some(clause) = clause {
            mapper.visit(clause);
        }
        self.state
            .database()
            .describe_plan(table_name, &mapper)
            .unwrap_or_else(|| "SCAN".into())
    }

    /// Whether a dependent removal can be answered by an index on the
    /// dependent's FK column, or only by a scan.
    fn dependent_index(&self, table_name: &str, column: usize) -> String {
        let schema = self.state.sharder().table(table_name).schema.clone();
        let mut mapper = ValueMapper::new(schema.column_names());
        mapper.add_values(column, vec![Value::Uint(0)]);
        let description = self
            .state
            .database()
            .describe_plan(table_name, &mapper)
            .unwrap_or_else(|| "SCAN".into());
        if description == "SCAN" {
            description
        } else {
            schema.name_of(column).to_string()
        }
    }

    /// Cascaded insertions into dependent tables.
    fn recurse_inserts(&mut self, table_name: &str, first: bool) {
        let dependents = self.state.sharder().table(table_name).dependents.clone();
        for (next_table, desc) in dependents {
            if matches!(desc.info, ShardingInfo::Direct(_)) {
                continue;
            }
            if first && matches!(desc.info, ShardingInfo::Transitive(_)) {
                continue;
            }
            self.add(
                format!("INSERT [{}#{}]", desc.shard_kind, desc.column()),
                next_table.clone(),
            );
            self.index_updates(&next_table);
            self.recurse_inserts(&next_table, false);
        }
    }

    /// Cascaded removals from dependent tables; `shard_kind` restricts the
    /// walk once a branch commits to one kind ("*" means any).
    fn recurse_deletes(&mut self, shard_kind: &str, table_name: &str, first: bool) {
        let dependents = self.state.sharder().table(table_name).dependents.clone();
        for (next_table, desc) in dependents {
            if shard_kind != "*" && desc.shard_kind != shard_kind {
                continue;
            }
            if matches!(desc.info, ShardingInfo::Direct(_)) {
                continue;
            }
            if first && matches!(desc.info, ShardingInfo::Transitive(_)) {
                continue;
            }
            let index = self.dependent_index(&next_table, desc.column_index());
            self.add(
                format!("DELETE [{}#{}]", desc.shard_kind, desc.column()),
                format!("{} BY {}", next_table, index),
            );
            self.index_updates(&next_table);
            self.recurse_deletes(&desc.shard_kind, &next_table, false);
        }
    }

    fn explain_insert(&mut self, table_name: &str) {
        let owners = self.state.sharder().table(table_name).owners.clone();
        for desc in &owners {
            let label = format!("INSERT [{}#{}]", desc.shard_kind, desc.column());
            match &desc.info {
                ShardingInfo::Direct(_) => self.add(label, table_name),
                ShardingInfo::Transitive(info) => {
                    let index = info
                        .index
                        .as_ref()
                        .map(|i| i.index_name.clone())
                        .unwrap_or_else(|| "SCAN".into());
                    self.add(label, format!("{} USING {}", table_name, index));
                }
                ShardingInfo::Variable(info) => self.add(
                    label,
                    format!(
                        "{} USING WHERE ON {}.{}",
                        table_name, info.origin_table, info.origin_column
                    ),
                ),
            }
            self.index_updates(table_name);
        }
        if owners.is_empty() {
            self.add("INSERT [default]", table_name);
            self.index_updates(table_name);
        }
        self.recurse_inserts(table_name, true);
        for view in self.state.dataflow().flows_affected_by(table_name) {
            self.add("VIEW UPDATE", view);
        }
    }

    fn explain_delete(&mut self, table_name: &str, clause: Option<&Expression>) {
        let owners = self.state.sharder().table(table_name).owners.clone();
        let index = self.lookup_index(table_name, clause);
        for desc in &owners {
            self.add(
                format!("DELETE [{}#{}]", desc.shard_kind, desc.column()),
                format!("{} USING {}", table_name, index),
            );
            self.index_updates(table_name);
        }
        if owners.is_empty() {
            self.add("DELETE [default]", format!("{} USING {}", table_name, index));
            self.index_updates(table_name);
        }
        self.recurse_deletes("*", table_name, true);
        for view in self.state.dataflow().flows_affected_by(table_name) {
            self.add("VIEW UPDATE", view);
        }
    }

    fn explain_select(&mut self, table_name: &str, clause: Option<&Expression>) {
        if self.state.dataflow().has_flow(table_name) {
            self.add("VIEW LOOKUP", table_name);
            return;
        }
        let index = self.lookup_index(table_name, clause);
        self.add("SELECT", format!("{} USING {}", table_name, index));
    }

    pub fn exec(mut self, statement: &Statement) -> Result<SqlResult> {
        let table_name = match statement {
            Statement::Insert(stmt) => &stmt.table_name,
            Statement::Replace(stmt) => &stmt.table_name,
            Statement::Update(stmt) => &stmt.table_name,
            Statement::Delete(stmt) => &stmt.table_name,
            Statement::Select(stmt) => &stmt.table_name,
            other => {
                return Err(Error::invalid(
                    "EXPLAIN",
                    "",
                    None,
                    format!("cannot explain {}", other.kind()),
                ))
            }
        };
        let is_view = matches!(statement, Statement::Select(_))
            && self.state.dataflow().has_flow(table_name);
        if !is_view && !self.state.sharder().table_exists(table_name) {
            return Err(Error::UnknownTable(table_name.clone()));
        }

        match statement {
            Statement::Insert(stmt) => self.explain_insert(&stmt.table_name),
            // A replace (and an update that moves rows) executes as a
            // delete followed by an insert. The replace's delete half is
            // keyed by the statement's pk value.
            Statement::Replace(stmt) => {
                let schema = self.state.sharder().table(&stmt.table_name).schema.clone();
                let pk = schema.keys()[0];
                let pk_name = schema.name_of(pk);
                let clause =
                    Expression::equality(pk_name, stmt.as_insert().value_of(pk_name, pk));
                self.explain_delete(&stmt.table_name, Some(&clause));
                self.explain_insert(&stmt.table_name);
            }
            Statement::Update(stmt) => {
                self.explain_delete(&stmt.table_name, stmt.where_clause.as_ref());
                self.explain_insert(&stmt.table_name);
            }
            Statement::Delete(stmt) => {
                self.explain_delete(&stmt.table_name, stmt.where_clause.as_ref());
            }
            Statement::Select(stmt) => {
                self.explain_select(&stmt.table_name, stmt.where_clause.as_ref());
            }
            _ => unreachable!(),
        }

        let schema = SchemaRef::new(
            vec!["action".into(), "target".into()],
            vec![ColumnType::Text, ColumnType::Text],
            vec![],
        );
        let records = self
            .lines
            .into_iter()
            .map(|(action, target)| {
                Record::from_values(
                    schema.clone(),
                    true,
                    vec![action.into(), target.into()],
                )
            })
            .collect();
        Ok(SqlResult::ResultSets(vec![SqlResultSet::new(
            schema, records,
        )]))
    }
}
