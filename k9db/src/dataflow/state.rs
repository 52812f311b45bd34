//! Dataflow engine: flows, partitioning, record routing and view lookup.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use fnv::FnvHasher;
use parking_lot::{Mutex, RwLock};

use super::graph::{CrossPartitionSend, GraphPartition};
use super::key::Key;
use super::record::Record;
use super::schema::SchemaRef;
use super::types::{ColumnId, NodeIndex};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

enum Message {
    /// A committed table batch entering the flow.
    Input { table: String, batch: Vec<Record> },
    /// A batch re-entering at an exchange from a sibling partition.
    Reenter { node: NodeIndex, batch: Vec<Record> },
}

/// One materialized flow, split into partitions. Each partition owns its
/// operator state; workers drain per-partition channels so batches from
/// one session apply in commit order.
pub struct DataFlow {
    name: String,
    partitions: Vec<Arc<Mutex<GraphPartition>>>,
    /// Partitioning key per input table.
    input_keys: HashMap<String, Vec<ColumnId>>,
    matview_node: NodeIndex,
    matview_key: Vec<ColumnId>,
    senders: Vec<Sender<Message>>,
    workers: Vec<JoinHandle<()>>,
}

fn hash_key(key: &Key) -> u64 {
    let mut hasher = FnvHasher::default();
    for value in key.values() {
        value.hash(&mut hasher);
    }
    hasher.finish()
}

impl DataFlow {
    /// Materialize a planned partition into `partitions` copies. With
    /// `consistent` set, batches are applied synchronously on the calling
    /// thread; otherwise each partition gets a worker thread.
    pub fn new(
        name: &str,
        proto: GraphPartition,
        partitions: usize,
        consistent: bool,
    ) -> DataFlow {
        assert!(partitions >= 1);
        let matview_node = proto.matview_node().expect("flow without a matview");
        let matview_key = proto.matview(matview_node).key_columns().to_vec();

        // Inputs partition on the planner-declared key, or the table's pk
        // when the planner says nothing.
        let mut input_keys = HashMap::new();
        for table in proto.input_tables() {
            let node = proto.input_node(&table).unwrap();
            let keys = proto
                .input_key(&table)
                .unwrap_or_else(|| proto.schema_of(node).keys().to_vec());
            input_keys.insert(table, keys);
        }

        let partition_list: Vec<Arc<Mutex<GraphPartition>>> = (0..partitions)
            .map(|i| Arc::new(Mutex::new(proto.clone_partition(i, partitions))))
            .collect();

        let mut senders = Vec::new();
        let mut workers = Vec::new();
        if !consistent {
            let mut receivers = Vec::new();
            for _ in 0..partitions {
                let (tx, rx) = bounded(CHANNEL_CAPACITY);
                senders.push(tx);
                receivers.push(rx);
            }
            for (i, receiver) in receivers.into_iter().enumerate() {
                let partition = partition_list[i].clone();
                let peers = senders.clone();
                let flow = name.to_string();
                workers.push(std::thread::spawn(move || {
                    while let Ok(message) = receiver.recv() {
                        let sends = match message {
                            Message::Input { table, batch } => {
                                partition.lock().process_input(&table, batch)
                            }
                            Message::Reenter { node, batch } => {
                                partition.lock().process(node, batch)
                            }
                        };
                        for send in sends {
                            let _ = peers[send.partition].send(Message::Reenter {
                                node: send.node,
                                batch: send.batch,
                            });
                        }
                    }
                    tracing::debug!(flow = flow.as_str(), partition = i, "worker exiting");
                }));
            }
        }

        DataFlow {
            name: name.to_string(),
            partitions: partition_list,
            input_keys,
            matview_node,
            matview_key,
            senders,
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reads_table(&self, table: &str) -> bool {
        self.input_keys.contains_key(table)
    }

    /// Tables (or forwarded views) this flow binds to.
    pub fn input_tables(&self) -> Vec<String> {
        self.input_keys.keys().cloned().collect()
    }

    pub fn output_schema(&self) -> SchemaRef {
        let partition = self.partitions[0].lock();
        partition.schema_of(self.matview_node).clone()
    }

    /// Route one committed batch of a table into the flow.
    pub fn process_records(&self, table: &str, batch: Vec<Record>) {
        let Some(key) = self.input_keys.get(table) else {
            return;
        };
        let n = self.partitions.len();
        let mut per_partition: Vec<Vec<Record>> = (0..n).map(|_| Vec::new()).collect();
        for record in batch {
            let target = if key.is_empty() {
                0
            } else {
                (record.hash_columns(key) % n as u64) as usize
            };
            per_partition[target].push(record);
        }
        for (i, batch) in per_partition.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            if self.senders.is_empty() {
                self.apply_sync(i, Message::Input {
                    table: table.to_string(),
                    batch,
                });
            } else {
                // Blocks when the partition's channel is full.
                self.senders[i]
                    .send(Message::Input {
                        table: table.to_string(),
                        batch,
                    })
                    .expect("dataflow worker is gone");
            }
        }
    }

    /// Synchronous processing: run to quiescence on the calling thread.
    fn apply_sync(&self, partition: usize, message: Message) {
        let mut pending: Vec<(usize, Message)> = vec![(partition, message)];
        while let Some((partition, message)) = pending.pop() {
            let sends: Vec<CrossPartitionSend> = match message {
                Message::Input { table, batch } => {
                    self.partitions[partition].lock().process_input(&table, batch)
                }
                Message::Reenter { node, batch } => {
                    self.partitions[partition].lock().process(node, batch)
                }
            };
            for send in sends {
                pending.push((
                    send.partition,
                    Message::Reenter {
                        node: send.node,
                        batch: send.batch,
                    },
                ));
            }
        }
    }

    /// Records under one matview key.
    pub fn lookup(&self, key: &Key, limit: Option<usize>, offset: usize) -> Vec<Record> {
        let n = self.partitions.len();
        let target = if n == 1 || self.matview_key.is_empty() {
            0
        } else {
            (hash_key(key) % n as u64) as usize
        };
        let partition = self.partitions[target].lock();
        partition.matview(self.matview_node).lookup(key, limit, offset)
    }

    /// Everything in the view, across partitions.
    pub fn all(&self, limit: Option<usize>, offset: usize) -> Vec<Record> {
        let mut out = Vec::new();
        for partition in &self.partitions {
            let partition = partition.lock();
            out.extend(partition.matview(self.matview_node).all(None, 0));
        }
        out.into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn size_in_memory(&self) -> u64 {
        self.partitions.iter().map(|p| p.lock().size_in_memory()).sum()
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.partitions[0].lock().debug_lines()
    }
}

impl Drop for DataFlow {
    fn drop(&mut self) {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// All flows plus the base table schemas they read.
pub struct DataFlowState {
    workers: usize,
    consistent: bool,
    schemas: RwLock<HashMap<String, SchemaRef>>,
    flows: RwLock<HashMap<String, Arc<DataFlow>>>,
}

impl DataFlowState {
    pub fn new(workers: usize, consistent: bool) -> DataFlowState {
        DataFlowState {
            workers: workers.max(1),
            consistent,
            schemas: RwLock::new(HashMap::new()),
            flows: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_table_schema(&self, table: &str, schema: SchemaRef) {
        self.schemas.write().insert(table.to_string(), schema);
    }

    pub fn table_schema(&self, table: &str) -> Option<SchemaRef> {
        self.schemas.read().get(table).cloned()
    }

    pub fn has_flow(&self, name: &str) -> bool {
        self.flows.read().contains_key(name)
    }

    /// Install a planned flow under the given view name.
    pub fn add_flow(&self, name: &str, proto: GraphPartition) {
        let flow = DataFlow::new(name, proto, self.workers, self.consistent);
        self.flows.write().insert(name.to_string(), Arc::new(flow));
        tracing::info!(view = name, "installed dataflow");
    }

    pub fn flow(&self, name: &str) -> Result<Arc<DataFlow>> {
        self.flows
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownView(name.to_string()))
    }

    /// Flows reading the given table, for EXPLAIN.
    pub fn flows_affected_by(&self, table: &str) -> Vec<String> {
        self.flows
            .read()
            .values()
            .filter(|f| f.reads_table(table))
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Deliver a committed batch to every flow reading the table.
    pub fn process_records(&self, table: &str, batch: Vec<Record>) {
        if batch.is_empty() {
            return;
        }
        let flows: Vec<Arc<DataFlow>> = self
            .flows
            .read()
            .values()
            .filter(|f| f.reads_table(table))
            .cloned()
            .collect();
        if flows.is_empty() {
            return;
        }
        let last = flows.len() - 1;
        let mut batch = Some(batch);
        for (i, flow) in flows.iter().enumerate() {
            let copy = if i == last {
                batch.take().unwrap()
            } else {
                batch.as_ref().unwrap().iter().map(|r| r.copy()).collect()
            };
            flow.process_records(table, copy);
        }
    }

    /// Forward one view's delta into every flow that reads it through a
    /// forward-view binding. Invoked by whoever owns the source flow's
    /// output (the planner wires the chain).
    pub fn process_view_records(&self, view: &str, batch: Vec<Record>) {
        self.process_records(view, batch);
    }

    pub fn lookup(
        &self,
        view: &str,
        key: &Key,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Record>> {
        Ok(self.flow(view)?.lookup(key, limit, offset))
    }

    pub fn lookup_all(&self, view: &str, limit: Option<usize>, offset: usize) -> Result<Vec<Record>> {
        Ok(self.flow(view)?.all(limit, offset))
    }

    /// Per-flow memory estimates.
    pub fn size_in_memory(&self) -> Vec<(String, u64)> {
        self.flows
            .read()
            .iter()
            .map(|(name, flow)| (name.clone(), flow.size_in_memory()))
            .collect()
    }
}
