//! CREATE TABLE: compiles annotations into the ownership graph.

use std::sync::atomic::AtomicI64;

use k9db_sqlast::{ColumnDefinition, ColumnType, CreateTable, ForeignKeyKind};

use super::index;
use crate::connection::State;
use crate::dataflow::schema::SchemaRef;
use crate::error::{Error, Result};
use crate::shards::types::{
    DirectInfo, ShardDescriptor, ShardingInfo, Table, TransitiveInfo, VariableInfo,
};
use crate::sql::SqlResult;

const STATEMENT: &str = "CREATE TABLE";

/// Column positions by annotation kind.
#[derive(Debug, Default)]
struct Annotations {
    explicit_owners: Vec<usize>,
    implicit_owners: Vec<usize>,
    accessors: Vec<usize>,
    owns: Vec<usize>,
    accesses: Vec<usize>,
}

pub struct CreateContext<'a> {
    stmt: &'a CreateTable,
    state: &'a mut State,
    schema: SchemaRef,
}

impl<'a> CreateContext<'a> {
    pub fn new(stmt: &'a CreateTable, state: &'a mut State) -> CreateContext<'a> {
        let schema = SchemaRef::from_create_table(stmt);
        CreateContext {
            stmt,
            state,
            schema,
        }
    }

    fn invalid(&self, column: Option<&str>, message: impl Into<String>) -> Error {
        Error::invalid(STATEMENT, &self.stmt.table_name, column, message)
    }

    /// Classify and validate every foreign key annotation.
    fn discover_validate(&self) -> Result<Annotations> {
        let sharder = self.state.sharder();
        let mut annotations = Annotations::default();
        for (i, column) in self.stmt.columns.iter().enumerate() {
            let Some((foreign_table, foreign_column, kind)) = column.foreign_key() else {
                continue;
            };

            let self_fk = foreign_table == self.stmt.table_name;
            if !self_fk && !sharder.table_exists(foreign_table) {
                return Err(self.invalid(
                    Some(&column.name),
                    "foreign key points to a nonexistent table",
                ));
            }

            let (foreign_owned, foreign_accessed, points_to_pk) = if self_fk {
                let owned = !annotations.explicit_owners.is_empty()
                    || !annotations.implicit_owners.is_empty()
                    || self.stmt.data_subject;
                let accessed = !annotations.accessors.is_empty() || owned;
                let pk = self
                    .stmt
                    .get_column(foreign_column)
                    .map(|c| c.is_primary_key())
                    .unwrap_or(false);
                if self.stmt.get_column(foreign_column).is_none() {
                    return Err(self.invalid(
                        Some(&column.name),
                        "foreign key points to a nonexistent column",
                    ));
                }
                (owned, accessed, pk)
            } else {
                let target = sharder.table(foreign_table);
                let Some(target_index) = target.schema.index_of(foreign_column) else {
                    return Err(self.invalid(
                        Some(&column.name),
                        "foreign key points to a nonexistent column",
                    ));
                };
                (
                    sharder.is_owned(foreign_table),
                    sharder.is_accessed(foreign_table),
                    target.schema.keys() == [target_index],
                )
            };

            match kind {
                ForeignKeyKind::OwnedBy => {
                    if !foreign_owned {
                        return Err(
                            self.invalid(Some(&column.name), "OWNED_BY a non data subject")
                        );
                    }
                    if !points_to_pk {
                        return Err(self.invalid(
                            Some(&column.name),
                            "OWNED_BY does not point to a primary key",
                        ));
                    }
                    if self_fk {
                        return Err(
                            self.invalid(Some(&column.name), "OWNED_BY a self-referencing key")
                        );
                    }
                    annotations.explicit_owners.push(i);
                }
                ForeignKeyKind::AccessedBy => {
                    if !foreign_accessed {
                        return Err(
                            self.invalid(Some(&column.name), "ACCESSED_BY an unreachable table")
                        );
                    }
                    if !points_to_pk {
                        return Err(self.invalid(
                            Some(&column.name),
                            "ACCESSED_BY does not point to a primary key",
                        ));
                    }
                    annotations.accessors.push(i);
                }
                ForeignKeyKind::Owns => {
                    if !points_to_pk {
                        return Err(self.invalid(
                            Some(&column.name),
                            "OWNS does not point to a primary key",
                        ));
                    }
                    if self_fk {
                        return Err(
                            self.invalid(Some(&column.name), "OWNS on a self-referencing key")
                        );
                    }
                    annotations.owns.push(i);
                }
                ForeignKeyKind::Accesses => {
                    if !points_to_pk {
                        return Err(self.invalid(
                            Some(&column.name),
                            "ACCESSES does not point to a primary key",
                        ));
                    }
                    annotations.accesses.push(i);
                }
                ForeignKeyKind::Auto => {
                    // Plain REFERENCES against an owned table is an
                    // implicit owner candidate.
                    if foreign_owned {
                        if !points_to_pk {
                            return Err(self.invalid(
                                Some(&column.name),
                                "implicit owner does not point to a primary key",
                            ));
                        }
                        annotations.implicit_owners.push(i);
                    }
                }
                ForeignKeyKind::Plain => {}
            }
        }

        if annotations.explicit_owners.is_empty() && annotations.implicit_owners.len() > 1 {
            return Err(self.invalid(None, "several implicit owners, annotate explicitly"));
        }
        Ok(annotations)
    }

    /// Lift the parent's descriptors through a forward FK (OWNED_BY or
    /// ACCESSED_BY) into descriptors of this table. One descriptor per
    /// reachable shard kind; transitivity gets a chain index when the edge
    /// carries ownership.
    fn make_forward_descriptors(
        &self,
        owners: bool,
        create_indices: bool,
        fk_column: &ColumnDefinition,
        fk_index: usize,
        fk_type: ColumnType,
        own_table: &Table,
    ) -> Vec<ShardDescriptor> {
        let (next_table, next_column, _) = fk_column.foreign_key().unwrap();
        let self_fk = next_table == self.stmt.table_name;
        let sharder = self.state.sharder();
        let target = if self_fk {
            own_table
        } else {
            sharder.table(next_table)
        };
        let next_column_index = target.schema.index_of(next_column).unwrap();
        let source = if owners {
            &target.owners
        } else {
            &target.accessors
        };

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for next in source {
            if !seen.insert(next.shard_kind.clone()) {
                continue;
            }
            let info = if next.shard_kind == next_table && !self_fk {
                ShardingInfo::Direct(DirectInfo {
                    column: fk_column.name.clone(),
                    column_index: fk_index,
                    column_type: fk_type,
                    next_column: next_column.to_string(),
                    next_column_index,
                })
            } else {
                let chain = create_indices.then(|| {
                    index::create(
                        self.state,
                        next_table,
                        &next.shard_kind,
                        next_column,
                        next_column_index,
                    )
                });
                ShardingInfo::Transitive(TransitiveInfo {
                    column: fk_column.name.clone(),
                    column_index: fk_index,
                    column_type: fk_type,
                    next_table: next_table.to_string(),
                    next_column: next_column.to_string(),
                    next_column_index,
                    index: chain,
                })
            };
            result.push(ShardDescriptor {
                shard_kind: next.shard_kind.clone(),
                info,
            });
        }
        result
    }

    /// Lift this table's descriptors through a backward FK (OWNS or
    /// ACCESSES) into Variable descriptors of the target table.
    fn make_backward_descriptors(
        &self,
        owners: bool,
        origin_column: &ColumnDefinition,
        origin_index: usize,
        own_table: &Table,
    ) -> Vec<ShardDescriptor> {
        let (target_table, target_column, _) = origin_column.foreign_key().unwrap();
        let target = self.state.sharder().table(target_table);
        let target_column_index = target.schema.index_of(target_column).unwrap();
        let origin_type = self.schema.type_of(origin_index);
        let source = if owners {
            &own_table.owners
        } else {
            &own_table.accessors
        };

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for desc in source {
            if !seen.insert(desc.shard_kind.clone()) {
                continue;
            }
            result.push(ShardDescriptor {
                shard_kind: desc.shard_kind.clone(),
                info: ShardingInfo::Variable(VariableInfo {
                    column: target_column.to_string(),
                    column_index: target_column_index,
                    column_type: origin_type,
                    origin_table: self.stmt.table_name.clone(),
                    origin_column: origin_column.name.clone(),
                    origin_column_index: origin_index,
                }),
            });
        }
        result
    }

    /// DEL anonymization must never touch the pk or an unrelated ownership
    /// column.
    fn validate_anonymization_rules(&self, table: &Table) -> Result<()> {
        let pk_name = self.schema.name_of(self.schema.keys()[0]).to_string();
        let mut owner_columns: std::collections::HashSet<&str> =
            table.owners.iter().map(|d| d.column().as_str()).collect();
        for (i, column) in self.stmt.columns.iter().enumerate() {
            if matches!(
                column.foreign_key(),
                Some((_, _, ForeignKeyKind::Owns))
            ) {
                owner_columns.insert(self.schema.name_of(i));
            }
        }

        for rule in &self.stmt.anonymization_rules {
            if rule.rule_type != k9db_sqlast::AnonymizationType::Del {
                continue;
            }
            for column in &rule.anonymize_columns {
                if *column == pk_name {
                    return Err(
                        self.invalid(Some(column), "anonymization rule nullifies the primary key")
                    );
                }
                if *column != rule.data_subject && owner_columns.contains(column.as_str()) {
                    return Err(self.invalid(
                        Some(column),
                        "anonymization rule nullifies another ownership column",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn exec(self) -> Result<SqlResult> {
        let table_name = self.stmt.table_name.clone();
        if self.state.sharder().table_exists(&table_name) {
            return Err(self.invalid(None, "table already exists"));
        }
        if self.schema.keys().len() != 1 {
            return Err(self.invalid(None, "tables must have exactly one primary key column"));
        }
        let pk_index = self.schema.keys()[0];
        let pk_column = self.schema.name_of(pk_index).to_string();

        let mut table = Table::new(self.stmt.clone(), self.schema.clone());

        // AUTO_INCREMENT and DEFAULT columns.
        for (i, column) in self.stmt.columns.iter().enumerate() {
            if column.auto_increment() {
                if self.schema.type_of(i) != ColumnType::Int {
                    return Err(
                        self.invalid(Some(&column.name), "AUTO_INCREMENT column must be INT")
                    );
                }
                if column.default_value().is_some() {
                    return Err(self.invalid(
                        Some(&column.name),
                        "AUTO_INCREMENT column cannot have a default",
                    ));
                }
                table.auto_increments.insert(column.name.clone());
            }
            if let Some(default) = column.default_value() {
                if !default.type_compatible(self.schema.type_of(i)) {
                    return Err(self.invalid(
                        Some(&column.name),
                        "DEFAULT value incompatible with column type",
                    ));
                }
                table.defaults.insert(column.name.clone(), default.clone());
            }
        }

        let annotations = self.discover_validate()?;

        // A data subject is its own shard kind and owns itself directly.
        let mut owner_descriptors = Vec::new();
        if self.stmt.data_subject {
            owner_descriptors.push(ShardDescriptor {
                shard_kind: table_name.clone(),
                info: ShardingInfo::Direct(DirectInfo {
                    column: pk_column.clone(),
                    column_index: pk_index,
                    column_type: self.schema.type_of(pk_index),
                    next_column: pk_column.clone(),
                    next_column_index: pk_index,
                }),
            });
        }

        // Direct and transitive owners. Owners of the parent also become
        // accessors of this table (owners are accessors).
        let mut accessor_descriptors = Vec::new();
        let owner_columns = if annotations.explicit_owners.is_empty() {
            &annotations.implicit_owners
        } else {
            &annotations.explicit_owners
        };
        for i in owner_columns {
            let column = &self.stmt.columns[*i];
            let fk_type = self.schema.type_of(*i);
            owner_descriptors.extend(
                self.make_forward_descriptors(true, true, column, *i, fk_type, &table),
            );
            accessor_descriptors.extend(
                self.make_forward_descriptors(false, false, column, *i, fk_type, &table),
            );
        }

        // Accessors through ACCESSED_BY: both owners and accessors of the
        // parent can reach this table.
        for i in &annotations.accessors {
            let column = &self.stmt.columns[*i];
            let fk_type = self.schema.type_of(*i);
            accessor_descriptors.extend(
                self.make_forward_descriptors(true, false, column, *i, fk_type, &table),
            );
            accessor_descriptors.extend(
                self.make_forward_descriptors(false, false, column, *i, fk_type, &table),
            );
        }

        // Stash descriptors on the table for rule validation and for the
        // backward (OWNS/ACCESSES) lifting, which reads them.
        table.owners = owner_descriptors;
        table.accessors = accessor_descriptors;
        self.validate_anonymization_rules(&table)?;

        let mut backward_owners = Vec::new();
        let mut backward_accessors = Vec::new();
        for i in &annotations.owns {
            let column = &self.stmt.columns[*i];
            let (target, _, _) = column.foreign_key().unwrap();
            backward_owners.push((
                target.to_string(),
                self.make_backward_descriptors(true, column, *i, &table),
            ));
            backward_accessors.push((
                target.to_string(),
                self.make_backward_descriptors(false, column, *i, &table),
            ));
        }
        for i in &annotations.accesses {
            let column = &self.stmt.columns[*i];
            let (target, _, _) = column.foreign_key().unwrap();
            backward_accessors.push((
                target.to_string(),
                self.make_backward_descriptors(true, column, *i, &table),
            ));
            backward_accessors.push((
                target.to_string(),
                self.make_backward_descriptors(false, column, *i, &table),
            ));
        }
        let owner_descriptors = std::mem::take(&mut table.owners);
        let accessor_descriptors = std::mem::take(&mut table.accessors);

        // Physical table first, then the graph.
        self.state.database().execute_create_table(self.stmt)?;
        self.state
            .dataflow()
            .add_table_schema(&table_name, self.schema.clone());

        let sharder = self.state.sharder_mut();
        if self.stmt.data_subject {
            sharder.add_shard_kind(&table_name, &pk_column, pk_index);
        }
        sharder.add_table(table);
        sharder.add_table_owners(&table_name, owner_descriptors);
        sharder.add_table_accessors(&table_name, accessor_descriptors);
        for (target, descriptors) in backward_owners {
            sharder.add_table_owners(&target, descriptors);
        }
        for (target, descriptors) in backward_accessors {
            sharder.add_table_accessors(&target, descriptors);
        }

        // Restore the AUTO_INCREMENT counter from the stored maximum in
        // case this is a reopen.
        let auto_column = self
            .state
            .sharder()
            .table(&table_name)
            .auto_increments
            .iter()
            .next()
            .cloned();
        if let Some(column) = auto_column {
            let max = self.state.database().get_maximum_value(&table_name, &column)?;
            self.state.sharder_mut().table_mut(&table_name).counter =
                Some(AtomicI64::new(max + 1));
        }

        tracing::info!(table = table_name.as_str(), "created table");
        Ok(SqlResult::Statement(true))
    }
}
