//! Projection operator.

use k9db_sqlast::{ColumnType, Value};

use crate::dataflow::record::{arithmetic, Record};
use crate::dataflow::schema::SchemaRef;
use crate::dataflow::types::ColumnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Plus,
    Minus,
}

#[derive(Debug, Clone)]
pub enum Operand {
    Column(ColumnId),
    Literal(Value),
}

/// One output column of the projection.
#[derive(Debug, Clone)]
pub enum Projection {
    Column { name: String, column: ColumnId },
    Literal { name: String, value: Value },
    Arithmetic {
        name: String,
        op: ArithmeticOp,
        left: Operand,
        right: Operand,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ProjectOperator {
    projections: Vec<Projection>,
    output_schema: Option<SchemaRef>,
}

impl ProjectOperator {
    pub fn new() -> ProjectOperator {
        ProjectOperator::default()
    }

    pub fn add_column(&mut self, name: impl Into<String>, column: ColumnId) {
        self.projections.push(Projection::Column {
            name: name.into(),
            column,
        });
    }

    pub fn add_literal(&mut self, name: impl Into<String>, value: Value) {
        self.projections.push(Projection::Literal {
            name: name.into(),
            value,
        });
    }

    pub fn add_arithmetic(
        &mut self,
        name: impl Into<String>,
        op: ArithmeticOp,
        left: Operand,
        right: Operand,
    ) {
        self.projections.push(Projection::Arithmetic {
            name: name.into(),
            op,
            left,
            right,
        });
    }

    fn operand_type(input: &SchemaRef, operand: &Operand) -> ColumnType {
        match operand {
            Operand::Column(column) => input.type_of(*column),
            Operand::Literal(value) => value
                .column_type()
                .expect("NULL literal operand in projection"),
        }
    }

    pub fn compute_schema(&mut self, input: &SchemaRef) -> SchemaRef {
        let mut names = Vec::new();
        let mut types = Vec::new();
        for projection in &self.projections {
            match projection {
                Projection::Column { name, column } => {
                    names.push(name.clone());
                    types.push(input.type_of(*column));
                }
                Projection::Literal { name, value } => {
                    names.push(name.clone());
                    types.push(value.column_type().expect("NULL literal projection"));
                }
                Projection::Arithmetic {
                    name,
                    op,
                    left,
                    right,
                } => {
                    let (l, r) = (
                        Self::operand_type(input, left),
                        Self::operand_type(input, right),
                    );
                    assert!(
                        matches!(l, ColumnType::Uint | ColumnType::Int)
                            && matches!(r, ColumnType::Uint | ColumnType::Int),
                        "arithmetic projection over non-integer columns"
                    );
                    names.push(name.clone());
                    // Unsigned minus unsigned promotes to signed.
                    let out = if l == ColumnType::Uint && r == ColumnType::Uint {
                        match op {
                            ArithmeticOp::Plus => ColumnType::Uint,
                            ArithmeticOp::Minus => ColumnType::Int,
                        }
                    } else {
                        ColumnType::Int
                    };
                    types.push(out);
                }
            }
        }

        // The pk survives only if every key column is projected unchanged.
        let mut keys = Vec::new();
        for key in input.keys() {
            let projected = self.projections.iter().position(
                |p| matches!(p, Projection::Column { column, .. } if column == key),
            );
            match projected {
                Some(position) => keys.push(position),
                None => {
                    keys.clear();
                    break;
                }
            }
        }

        let schema = SchemaRef::new(names, types, keys);
        self.output_schema = Some(schema.clone());
        schema
    }

    fn evaluate(record: &Record, operand: &Operand) -> Value {
        match operand {
            Operand::Column(column) => record.get_value(*column),
            Operand::Literal(value) => value.clone(),
        }
    }

    pub fn process(&self, batch: Vec<Record>) -> Vec<Record> {
        let schema = self
            .output_schema
            .as_ref()
            .expect("projection schema not computed")
            .clone();
        batch
            .into_iter()
            .map(|record| {
                let values = self
                    .projections
                    .iter()
                    .map(|projection| match projection {
                        Projection::Column { column, .. } => record.get_value(*column),
                        Projection::Literal { value, .. } => value.clone(),
                        Projection::Arithmetic {
                            op, left, right, ..
                        } => {
                            let (l, r) = (
                                Self::evaluate(&record, left),
                                Self::evaluate(&record, right),
                            );
                            if l.is_null() || r.is_null() {
                                Value::Null
                            } else {
                                arithmetic(&l, &r, matches!(op, ArithmeticOp::Minus))
                            }
                        }
                    })
                    .collect();
                Record::from_values(schema.clone(), record.is_positive(), values)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> SchemaRef {
        SchemaRef::new(
            vec!["id".into(), "paid".into(), "due".into()],
            vec![ColumnType::Int, ColumnType::Uint, ColumnType::Uint],
            vec![0],
        )
    }

    fn row(id: i64, paid: u64, due: u64) -> Record {
        Record::from_values(
            schema(),
            true,
            vec![Value::Int(id), Value::Uint(paid), Value::Uint(due)],
        )
    }

    #[test]
    fn columns_and_literals() {
        let mut project = ProjectOperator::new();
        project.add_column("id", 0);
        project.add_literal("one", Value::Uint(1));
        let out_schema = project.compute_schema(&schema());
        assert_eq!(out_schema.keys(), &[0]);

        let out = project.process(vec![row(1, 5, 10)]);
        assert_eq!(out[0].get_value(0), Value::Int(1));
        assert_eq!(out[0].get_value(1), Value::Uint(1));
    }

    #[test]
    fn unsigned_minus_promotes_to_signed() {
        let mut project = ProjectOperator::new();
        project.add_arithmetic(
            "balance",
            ArithmeticOp::Minus,
            Operand::Column(1),
            Operand::Column(2),
        );
        let out_schema = project.compute_schema(&schema());
        assert_eq!(out_schema.type_of(0), ColumnType::Int);
        // Key is gone since id was not projected.
        assert!(out_schema.keys().is_empty());

        let out = project.process(vec![row(1, 5, 10)]);
        assert_eq!(out[0].get_value(0), Value::Int(-5));
    }

    #[test]
    fn unsigned_plus_stays_unsigned() {
        let mut project = ProjectOperator::new();
        project.add_arithmetic(
            "total",
            ArithmeticOp::Plus,
            Operand::Column(1),
            Operand::Literal(Value::Uint(2)),
        );
        let out_schema = project.compute_schema(&schema());
        assert_eq!(out_schema.type_of(0), ColumnType::Uint);
        let out = project.process(vec![row(1, 5, 10)]);
        assert_eq!(out[0].get_value(0), Value::Uint(7));
    }

    #[test]
    fn null_operand_yields_null() {
        let mut project = ProjectOperator::new();
        project.add_arithmetic(
            "total",
            ArithmeticOp::Plus,
            Operand::Column(1),
            Operand::Column(2),
        );
        project.compute_schema(&schema());
        let mut record = row(1, 5, 10);
        record.set_null(2);
        let out = project.process(vec![record]);
        assert!(out[0].is_null(0));
    }
}
