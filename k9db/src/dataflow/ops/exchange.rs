//! Exchange operator: hash-partitions a batch across partitions.
//!
//! Records whose key hashes to this partition flow through unchanged;
//! the rest land in the outbox, which the graph runner delivers to the
//! sibling partitions (re-entering each at this operator's node). The
//! positive/negative pairing of a row is preserved because the hash only
//! looks at key columns.

use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::dataflow::types::{ColumnId, PartitionIndex};

pub struct ExchangeOperator {
    key: Vec<ColumnId>,
    partition: PartitionIndex,
    partitions: usize,
    outbox: Vec<(PartitionIndex, Vec<Record>)>,
}

impl ExchangeOperator {
    pub fn new(key: Vec<ColumnId>) -> ExchangeOperator {
        ExchangeOperator {
            key,
            partition: 0,
            partitions: 1,
            outbox: Vec::new(),
        }
    }

    /// Called by the graph when partitions are materialized.
    pub fn assign(&mut self, partition: PartitionIndex, partitions: usize) {
        self.partition = partition;
        self.partitions = partitions;
    }

    pub fn key(&self) -> &[ColumnId] {
        &self.key
    }

    pub fn clone_op(&self) -> ExchangeOperator {
        ExchangeOperator {
            key: self.key.clone(),
            partition: self.partition,
            partitions: self.partitions,
            outbox: Vec::new(),
        }
    }

    pub fn compute_schema(&self, input: &SchemaRef) -> SchemaRef {
        input.clone()
    }

    pub fn process(&mut self, batch: Vec<Record>) -> Vec<Record> {
        if self.partitions == 1 {
            return batch;
        }
        let mut local = Vec::new();
        let mut remote: Vec<Vec<Record>> = (0..self.partitions).map(|_| Vec::new()).collect();
        for record in batch {
            let target = (record.hash_columns(&self.key) % self.partitions as u64) as usize;
            if target == self.partition {
                local.push(record);
            } else {
                remote[target].push(record);
            }
        }
        for (partition, records) in remote.into_iter().enumerate() {
            if !records.is_empty() {
                self.outbox.push((partition, records));
            }
        }
        local
    }

    /// Batches destined for other partitions, drained by the runner.
    pub fn drain_outbox(&mut self) -> Vec<(PartitionIndex, Vec<Record>)> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataflow::schema::SchemaRef;
    use k9db_sqlast::{ColumnType, Value};

    fn schema() -> SchemaRef {
        SchemaRef::new(vec!["id".into()], vec![ColumnType::Uint], vec![0])
    }

    fn row(id: u64) -> Record {
        Record::from_values(schema(), true, vec![Value::Uint(id)])
    }

    #[test]
    fn routes_by_hash() {
        let mut exchange = ExchangeOperator::new(vec![0]);
        exchange.assign(0, 2);
        let batch: Vec<Record> = (0..16).map(row).collect();
        let local = exchange.process(batch);
        let outbox = exchange.drain_outbox();
        let remote: usize = outbox.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(local.len() + remote, 16);
        // Same record always goes to the same place.
        let mut exchange2 = ExchangeOperator::new(vec![0]);
        exchange2.assign(0, 2);
        let local2 = exchange2.process((0..16).map(row).collect());
        assert_eq!(local.len(), local2.len());
    }

    #[test]
    fn single_partition_passes_through() {
        let mut exchange = ExchangeOperator::new(vec![0]);
        exchange.assign(0, 1);
        let local = exchange.process(vec![row(1), row(2)]);
        assert_eq!(local.len(), 2);
        assert!(exchange.drain_outbox().is_empty());
    }
}
