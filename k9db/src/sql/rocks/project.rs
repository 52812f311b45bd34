//! SELECT projection applied to fetched rows.

use k9db_sqlast::{ResultColumn, Value};

use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;

/// A compiled projection: the output schema plus, per output column, where
/// its value comes from.
#[derive(Debug, Clone)]
pub struct Projection {
    schema: SchemaRef,
    sources: Vec<ProjectionSource>,
    identity: bool,
}

#[derive(Debug, Clone)]
enum ProjectionSource {
    Column(usize),
    Literal(Value),
}

impl Projection {
    pub fn compile(schema: &SchemaRef, projection: &[ResultColumn]) -> Projection {
        if projection.iter().any(|c| matches!(c, ResultColumn::All)) {
            return Projection {
                schema: schema.clone(),
                sources: Vec::new(),
                identity: true,
            };
        }

        let mut names = Vec::new();
        let mut types = Vec::new();
        let mut sources = Vec::new();
        let mut keys = Vec::new();
        for column in projection {
            match column {
                ResultColumn::Column(name) => {
                    let i = schema
                        .index_of(name)
                        .unwrap_or_else(|| panic!("projection of unknown column {}", name));
                    if schema.keys().contains(&i) {
                        keys.push(names.len());
                    }
                    names.push(name.clone());
                    types.push(schema.type_of(i));
                    sources.push(ProjectionSource::Column(i));
                }
                ResultColumn::Literal(value) => {
                    names.push(value.to_string());
                    types.push(value.column_type().expect("cannot project a NULL literal"));
                    sources.push(ProjectionSource::Literal(value.clone()));
                }
                ResultColumn::All => unreachable!(),
            }
        }
        Projection {
            schema: SchemaRef::new(names, types, keys),
            sources,
            identity: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn apply(&self, record: &Record) -> Record {
        if self.identity {
            return record.copy();
        }
        let values = self
            .sources
            .iter()
            .map(|source| match source {
                ProjectionSource::Column(i) => record.get_value(*i),
                ProjectionSource::Literal(value) => value.clone(),
            })
            .collect();
        Record::from_values(self.schema.clone(), record.is_positive(), values)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::ColumnType;

    #[test]
    fn column_and_literal_projection() {
        let schema = SchemaRef::new(
            vec!["id".into(), "name".into()],
            vec![ColumnType::Int, ColumnType::Text],
            vec![0],
        );
        let record = Record::from_values(
            schema.clone(),
            true,
            vec![Value::Int(1), Value::Text("a".into())],
        );

        let projection = Projection::compile(
            &schema,
            &[
                ResultColumn::Column("name".into()),
                ResultColumn::Literal(Value::Uint(7)),
            ],
        );
        assert!(!projection.is_identity());
        let out = projection.apply(&record);
        assert_eq!(out.get_value(0), Value::Text("a".into()));
        assert_eq!(out.get_value(1), Value::Uint(7));
        // The pk did not survive, so the output has no key.
        assert!(projection.schema().keys().is_empty());
    }

    #[test]
    fn star_is_identity() {
        let schema = SchemaRef::new(vec!["id".into()], vec![ColumnType::Int], vec![0]);
        let projection = Projection::compile(&schema, &[ResultColumn::All]);
        assert!(projection.is_identity());
    }
}
