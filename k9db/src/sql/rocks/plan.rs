//! Index selection for WHERE lookups.

use crate::dataflow::schema::SchemaRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChoice {
    Pk,
    Unique,
    Regular,
    Scan,
}

/// How a given WHERE condition will be looked up against one table.
#[derive(Debug, Clone)]
pub struct Plan {
    table_name: String,
    schema: SchemaRef,
    choice: IndexChoice,
    /// The constrained columns the chosen index covers.
    columns: Vec<usize>,
    /// Position of the chosen secondary index.
    index: usize,
}

impl Plan {
    pub fn scan(table_name: &str, schema: &SchemaRef) -> Plan {
        Plan {
            table_name: table_name.to_string(),
            schema: schema.clone(),
            choice: IndexChoice::Scan,
            columns: Vec::new(),
            index: 0,
        }
    }

    pub fn pk(table_name: &str, schema: &SchemaRef, columns: Vec<usize>) -> Plan {
        Plan {
            choice: IndexChoice::Pk,
            columns,
            ..Plan::scan(table_name, schema)
        }
    }

    pub fn index(
        table_name: &str,
        schema: &SchemaRef,
        unique: bool,
        columns: Vec<usize>,
        index: usize,
    ) -> Plan {
        Plan {
            choice: if unique {
                IndexChoice::Unique
            } else {
                IndexChoice::Regular
            },
            columns,
            index,
            ..Plan::scan(table_name, schema)
        }
    }

    pub fn choice(&self) -> IndexChoice {
        self.choice
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn index_position(&self) -> usize {
        self.index
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Compact index choice for EXPLAIN, e.g. `PK (id)`, `INDEX (author)`
    /// or `SCAN`.
    pub fn index_description(&self) -> String {
        match self.choice {
            IndexChoice::Scan => "SCAN".into(),
            IndexChoice::Pk => format!("PK ({})", self.schema.name_of(self.columns[0])),
            IndexChoice::Unique | IndexChoice::Regular => {
                let names: Vec<&str> = self
                    .columns
                    .iter()
                    .map(|c| self.schema.name_of(*c))
                    .collect();
                format!("INDEX ({})", names.join(", "))
            }
        }
    }
}
