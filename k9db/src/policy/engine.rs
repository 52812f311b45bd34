//! Policy registration, instantiation and serialization.

use std::collections::HashMap;

use k9db_sqlast::{
    ColumnType, CreatePolicy, PolicyCombination, PolicyExpression, Value,
};

use super::policies::Policy;
use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::sql::result::SqlResultSet;

/// The serialized-policy column appended to result sets.
const POLICY_COLUMN: &str = "__policies";

/// Policy schemas per table. Mutated only under the connection's
/// exclusive lock.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    schemas: HashMap<String, Vec<CreatePolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> PolicyRegistry {
        PolicyRegistry::default()
    }

    pub fn add(&mut self, schema: CreatePolicy) {
        self.schemas
            .entry(schema.table_name.clone())
            .or_default()
            .push(schema);
    }

    pub fn for_table(&self, table_name: &str) -> &[CreatePolicy] {
        self.schemas
            .get(table_name)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_policies(&self, table_name: &str) -> bool {
        !self.for_table(table_name).is_empty()
    }
}

/// Instantiate one schema against one row.
fn make_policy(schema: &CreatePolicy, record: &Record) -> Policy {
    let mut clauses = Vec::with_capacity(schema.clauses.len());
    for clause in &schema.clauses {
        let values: Vec<Value> = clause
            .expressions
            .iter()
            .map(|expression| match expression {
                PolicyExpression::Literal(value) => value.clone(),
                PolicyExpression::Column(column) => {
                    let i = record
                        .schema()
                        .index_of(column)
                        .unwrap_or_else(|| panic!("policy names unknown column {}", column));
                    record.get_value(i)
                }
            })
            .collect();
        clauses.push(Policy::clause(clause.name.clone(), values));
    }
    match schema.combination {
        PolicyCombination::Single => clauses
            .into_iter()
            .next()
            .expect("policy schema with no clauses"),
        PolicyCombination::And => Policy::And(clauses),
        PolicyCombination::Or => Policy::Or(clauses),
    }
}

/// Attach policy instances to the given rows of `table_name`, on the
/// columns their schemas govern.
pub fn make_policies(registry: &PolicyRegistry, table_name: &str, records: &mut [Record]) {
    let schemas = registry.for_table(table_name);
    if schemas.is_empty() {
        return;
    }
    for record in records {
        for schema in schemas {
            let column = record
                .schema()
                .index_of(&schema.column)
                .unwrap_or_else(|| panic!("policy names unknown column {}", schema.column));
            let policy = make_policy(schema, record);
            record.set_policy(column, policy);
        }
    }
}

/// Serialize the policies of each result set into an extra text column so
/// the client sees which rules govern each row. Sets without any tagged
/// row pass through unchanged.
pub fn serialize_policies(sets: Vec<SqlResultSet>) -> Vec<SqlResultSet> {
    sets.into_iter().map(serialize_set).collect()
}

fn serialize_set(set: SqlResultSet) -> SqlResultSet {
    let tagged = set
        .rows()
        .iter()
        .any(|r| (0..r.schema().size()).any(|i| r.policy(i).is_some()));
    if !tagged {
        return set;
    }

    let schema = set.schema().clone();
    let mut names = schema.column_names().to_vec();
    let mut types = schema.column_types().to_vec();
    names.push(POLICY_COLUMN.into());
    types.push(ColumnType::Text);
    let extended = SchemaRef::new(names, types, schema.keys().to_vec());

    let records = set
        .into_rows()
        .into_iter()
        .map(|record| {
            let serialized: Vec<String> = (0..schema.size())
                .filter_map(|i| {
                    record
                        .policy(i)
                        .map(|p| format!("{}: {}", schema.name_of(i), p.serialize()))
                })
                .collect();
            let positive = record.is_positive();
            let mut values = record.into_values();
            values.push(if serialized.is_empty() {
                Value::Null
            } else {
                Value::Text(serialized.join("; "))
            });
            Record::from_values(extended.clone(), positive, values)
        })
        .collect();
    SqlResultSet::new(extended, records)
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::PolicyClause;

    fn schema() -> SchemaRef {
        SchemaRef::new(
            vec!["id".into(), "owner".into()],
            vec![ColumnType::Int, ColumnType::Int],
            vec![0],
        )
    }

    fn access_control() -> CreatePolicy {
        CreatePolicy {
            table_name: "notes".into(),
            column: "owner".into(),
            combination: PolicyCombination::Single,
            clauses: vec![PolicyClause {
                name: "AccessControl".into(),
                expressions: vec![
                    PolicyExpression::Column("owner".into()),
                    PolicyExpression::Literal("admin".into()),
                ],
            }],
        }
    }

    #[test]
    fn instantiates_against_row_values() {
        let mut registry = PolicyRegistry::new();
        registry.add(access_control());

        let mut records = vec![Record::from_values(
            schema(),
            true,
            vec![Value::Int(1), Value::Int(7)],
        )];
        make_policies(&registry, "notes", &mut records);

        let policy = records[0].policy(1).unwrap();
        assert_eq!(policy.serialize(), "AccessControl(7, 'admin')");
        assert!(records[0].policy(0).is_none());
        // Other tables are untouched.
        assert!(!registry.has_policies("users"));
    }

    #[test]
    fn serialization_extends_the_schema() {
        let mut registry = PolicyRegistry::new();
        registry.add(access_control());
        let mut records = vec![Record::from_values(
            schema(),
            true,
            vec![Value::Int(1), Value::Int(7)],
        )];
        make_policies(&registry, "notes", &mut records);

        let sets = serialize_policies(vec![SqlResultSet::new(schema(), records)]);
        let set = &sets[0];
        assert_eq!(set.schema().size(), 3);
        assert_eq!(set.schema().name_of(2), POLICY_COLUMN);
        assert_eq!(
            set.rows()[0].get_value(2),
            Value::Text("owner: AccessControl(7, 'admin')".into())
        );
    }

    #[test]
    fn untagged_sets_pass_through() {
        let records = vec![Record::from_values(
            schema(),
            true,
            vec![Value::Int(1), Value::Int(7)],
        )];
        let sets = serialize_policies(vec![SqlResultSet::new(schema(), records)]);
        assert_eq!(sets[0].schema().size(), 2);
    }
}
