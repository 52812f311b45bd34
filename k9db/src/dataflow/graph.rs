//! One partition of a dataflow graph: a sub-DAG of operators.

use std::collections::HashMap;

use super::ops::{copy_batch, Operator};
use super::record::Record;
use super::schema::SchemaRef;
use super::types::{NodeIndex, PartitionIndex};

/// A batch leaving this partition through an exchange, to re-enter a
/// sibling partition at the same node.
pub struct CrossPartitionSend {
    pub partition: PartitionIndex,
    pub node: NodeIndex,
    pub batch: Vec<Record>,
}

/// Operators plus parent/child edges. Built once by the planner, then
/// cloned per partition.
pub struct GraphPartition {
    nodes: Vec<Operator>,
    schemas: Vec<SchemaRef>,
    parents: Vec<Vec<NodeIndex>>,
    children: Vec<Vec<NodeIndex>>,
    inputs: HashMap<String, NodeIndex>,
    /// Partitioning key per input table; defaults to the table's pk.
    input_keys: HashMap<String, Vec<usize>>,
    matviews: Vec<NodeIndex>,
}

impl Default for GraphPartition {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphPartition {
    pub fn new() -> GraphPartition {
        GraphPartition {
            nodes: Vec::new(),
            schemas: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            inputs: HashMap::new(),
            input_keys: HashMap::new(),
            matviews: Vec::new(),
        }
    }

    /// Add an operator below the given parents. Computes its output schema
    /// immediately; schema mismatches are planner bugs and fail here.
    pub fn add_node(&mut self, mut op: Operator, parents: Vec<NodeIndex>) -> NodeIndex {
        let input_schemas: Vec<SchemaRef> =
            parents.iter().map(|p| self.schemas[*p].clone()).collect();
        let schema = op.compute_schema(&input_schemas);
        let index = self.nodes.len();
        match &op {
            Operator::Input { table, .. } => {
                self.inputs.insert(table.clone(), index);
            }
            // A forward view binds to another view's output the same way
            // an input binds to a table.
            Operator::ForwardView { view, .. } => {
                self.inputs.insert(view.clone(), index);
            }
            _ => {}
        }
        if op.is_matview() {
            self.matviews.push(index);
        }
        self.nodes.push(op);
        self.schemas.push(schema);
        self.parents.push(parents.clone());
        self.children.push(Vec::new());
        for parent in parents {
            self.children[parent].push(index);
        }
        index
    }

    pub fn schema_of(&self, node: NodeIndex) -> &SchemaRef {
        &self.schemas[node]
    }

    pub fn input_node(&self, table: &str) -> Option<NodeIndex> {
        self.inputs.get(table).copied()
    }

    pub fn input_tables(&self) -> Vec<String> {
        self.inputs.keys().cloned().collect()
    }

    /// Override the partitioning key of a table's input. The planner sets
    /// this to whatever columns downstream stateful operators group on, so
    /// co-grouped records land in the same partition.
    pub fn set_input_key(&mut self, table: &str, key: Vec<usize>) {
        self.input_keys.insert(table.to_string(), key);
    }

    pub fn input_key(&self, table: &str) -> Option<Vec<usize>> {
        self.input_keys.get(table).cloned()
    }

    pub fn matview_node(&self) -> Option<NodeIndex> {
        self.matviews.first().copied()
    }

    pub fn matview(&self, node: NodeIndex) -> &super::ops::MatViewOperator {
        match &self.nodes[node] {
            Operator::MatView(view) => view,
            _ => panic!("node is not a matview"),
        }
    }

    /// Fresh copy of this partition for another worker. Exchanges learn
    /// their new coordinates.
    pub fn clone_partition(&self, partition: PartitionIndex, partitions: usize) -> GraphPartition {
        let nodes = self
            .nodes
            .iter()
            .map(|op| {
                let mut clone = op.clone_op();
                if let Operator::Exchange(exchange) = &mut clone {
                    exchange.assign(partition, partitions);
                }
                clone
            })
            .collect();
        GraphPartition {
            nodes,
            schemas: self.schemas.clone(),
            parents: self.parents.clone(),
            children: self.children.clone(),
            inputs: self.inputs.clone(),
            input_keys: self.input_keys.clone(),
            matviews: self.matviews.clone(),
        }
    }

    /// Push a batch through the sub-DAG breadth-first starting at `entry`.
    /// Returns batches that must continue on sibling partitions.
    pub fn process(
        &mut self,
        entry: NodeIndex,
        batch: Vec<Record>,
    ) -> Vec<CrossPartitionSend> {
        let mut sends = Vec::new();
        let mut queue: std::collections::VecDeque<(NodeIndex, usize, Vec<Record>)> =
            std::collections::VecDeque::new();
        queue.push_back((entry, 0, batch));

        while let Some((node, position, batch)) = queue.pop_front() {
            let output = self.nodes[node].process(position, batch);
            if let Operator::Exchange(exchange) = &mut self.nodes[node] {
                for (partition, records) in exchange.drain_outbox() {
                    sends.push(CrossPartitionSend {
                        partition,
                        node,
                        batch: records,
                    });
                }
            }
            if output.is_empty() {
                continue;
            }
            let children = self.children[node].clone();
            let mut output = Some(output);
            for (i, child) in children.iter().enumerate() {
                // The last child takes the batch; earlier ones get copies.
                let child_batch = if i + 1 == children.len() {
                    output.take().unwrap()
                } else {
                    copy_batch(output.as_ref().unwrap())
                };
                let position = self.parents[*child]
                    .iter()
                    .position(|p| *p == node)
                    .expect("edge without back edge");
                queue.push_back((*child, position, child_batch));
            }
        }
        sends
    }

    /// Deliver a committed table batch to the table's input operator.
    pub fn process_input(&mut self, table: &str, batch: Vec<Record>) -> Vec<CrossPartitionSend> {
        let entry = self
            .input_node(table)
            .unwrap_or_else(|| panic!("flow has no input for table {}", table));
        self.process(entry, batch)
    }

    pub fn size_in_memory(&self) -> u64 {
        self.nodes.iter().map(|n| n.size_in_memory()).sum()
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, op)| {
                format!(
                    "[{}] {} <- {:?}",
                    i,
                    op.debug_string(),
                    self.parents[i]
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataflow::key::Key;
    use crate::dataflow::ops::{AggregateFunction, AggregateOperator, MatViewOperator, ViewOrder};
    use crate::dataflow::schema::SchemaRef;
    use k9db_sqlast::{ColumnType, Value};

    fn proto() -> GraphPartition {
        let schema = SchemaRef::new(
            vec!["dept".into(), "salary".into()],
            vec![ColumnType::Text, ColumnType::Uint],
            vec![0],
        );
        let mut graph = GraphPartition::new();
        let input = graph.add_node(
            Operator::Input {
                table: "salaries".into(),
                schema,
            },
            vec![],
        );
        let aggregate = graph.add_node(
            Operator::Aggregate(AggregateOperator::new(vec![0], AggregateFunction::Sum, 1)),
            vec![input],
        );
        graph.add_node(
            Operator::MatView(MatViewOperator::new(vec![0], ViewOrder::Unordered)),
            vec![aggregate],
        );
        graph
    }

    fn row(dept: &str, salary: u64) -> Record {
        let schema = SchemaRef::new(
            vec!["dept".into(), "salary".into()],
            vec![ColumnType::Text, ColumnType::Uint],
            vec![0],
        );
        Record::from_values(
            schema,
            true,
            vec![Value::Text(dept.into()), Value::Uint(salary)],
        )
    }

    fn sum_of(graph: &GraphPartition, dept: &str) -> Option<u64> {
        let view = graph.matview(graph.matview_node().unwrap());
        let rows = view.lookup(&Key::from(Value::Text(dept.into())), None, 0);
        rows.first().map(|r| r.get_uint(1))
    }

    #[test]
    fn disjoint_batches_commute() {
        let batch_a = || vec![row("eng", 10), row("ops", 7)];
        let batch_b = || vec![row("eng", 5)];

        let mut forward = proto().clone_partition(0, 1);
        forward.process_input("salaries", batch_a());
        forward.process_input("salaries", batch_b());

        let mut backward = proto().clone_partition(0, 1);
        backward.process_input("salaries", batch_b());
        backward.process_input("salaries", batch_a());

        assert_eq!(sum_of(&forward, "eng"), Some(15));
        assert_eq!(sum_of(&forward, "eng"), sum_of(&backward, "eng"));
        assert_eq!(sum_of(&forward, "ops"), sum_of(&backward, "ops"));
    }

    #[test]
    fn broadcast_copies_to_every_child() {
        let schema = SchemaRef::new(vec!["id".into()], vec![ColumnType::Int], vec![0]);
        let mut graph = GraphPartition::new();
        let input = graph.add_node(
            Operator::Input {
                table: "t".into(),
                schema: schema.clone(),
            },
            vec![],
        );
        let left = graph.add_node(
            Operator::MatView(MatViewOperator::new(vec![0], ViewOrder::Unordered)),
            vec![input],
        );
        let right = graph.add_node(
            Operator::MatView(MatViewOperator::new(vec![0], ViewOrder::Unordered)),
            vec![input],
        );

        let record = Record::from_values(schema, true, vec![Value::Int(3)]);
        graph.process_input("t", vec![record]);
        assert_eq!(graph.matview(left).count(), 1);
        assert_eq!(graph.matview(right).count(), 1);
    }
}
