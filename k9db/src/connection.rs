//! Global engine state and client connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use k9db_sqlast::{CreateIndex, CreateTable, CreateView, Statement};

use crate::config::Config;
use crate::dataflow::{DataFlowState, GraphPartition};
use crate::error::Result;
use crate::policy::PolicyRegistry;
use crate::prepared::{self, PreparedStatement};
use crate::session::Session;
use crate::shards::sqlengine;
use crate::shards::SharderState;
use crate::sql::rocks::RocksdbConnection;
use crate::sql::SqlResult;

/// Everything shared across sessions: the ownership graph, the dataflow
/// engine, the storage connection and the canonical prepared statements.
/// Lives behind the connection's reader/writer lock; DDL takes it
/// exclusively, everything else shared.
pub struct State {
    sharder: SharderState,
    dataflow: DataFlowState,
    database: RocksdbConnection,
    policy: PolicyRegistry,
    prepared: Mutex<HashMap<String, Arc<PreparedStatement>>>,
}

impl State {
    pub fn sharder(&self) -> &SharderState {
        &self.sharder
    }

    pub fn sharder_mut(&mut self) -> &mut SharderState {
        &mut self.sharder
    }

    pub fn dataflow(&self) -> &DataFlowState {
        &self.dataflow
    }

    pub fn database(&self) -> &RocksdbConnection {
        &self.database
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policy
    }

    pub fn policies_mut(&mut self) -> &mut PolicyRegistry {
        &mut self.policy
    }

    /// Look up or install a canonical prepared statement.
    pub fn canonical_statement(&self, statement: &Statement) -> Arc<PreparedStatement> {
        let canonical = prepared::canonicalize(statement);
        self.prepared
            .lock()
            .entry(canonical)
            .or_insert_with(|| PreparedStatement::new(statement.clone()))
            .clone()
    }

    pub fn canonical_statement_count(&self) -> usize {
        self.prepared.lock().len()
    }
}

/// A database handle. Owns the shared state; sessions hold a reference.
pub struct Connection {
    state: Arc<RwLock<State>>,
}

impl Connection {
    /// Open (or create) a database. Returns the CREATE statements earlier
    /// runs persisted; re-execute them through a session to rebuild the
    /// schema, the indices and the dataflow graph.
    pub fn open(config: &Config) -> Result<(Connection, Vec<Statement>)> {
        let (database, statements) = RocksdbConnection::open(&config.db_path())?;
        let state = State {
            sharder: SharderState::new(),
            dataflow: DataFlowState::new(config.workers, config.consistent),
            database,
            policy: PolicyRegistry::new(),
            prepared: Mutex::new(HashMap::new()),
        };
        tracing::info!(name = config.name.as_str(), "opened database");
        Ok((
            Connection {
                state: Arc::new(RwLock::new(state)),
            },
            statements,
        ))
    }

    pub fn open_session(&self) -> Session {
        Session::new(self.state.clone())
    }

    /// Closing is dropping: rocksdb flushes on drop and the dataflow
    /// workers drain their channels.
    pub fn close(self) {}

    pub fn execute_create_table(&self, stmt: &CreateTable) -> Result<SqlResult> {
        let mut state = self.state.write();
        sqlengine::execute_ddl(&Statement::CreateTable(stmt.clone()), &mut state)
    }

    pub fn execute_create_index(&self, stmt: &CreateIndex) -> Result<SqlResult> {
        let mut state = self.state.write();
        sqlengine::execute_ddl(&Statement::CreateIndex(stmt.clone()), &mut state)
    }

    pub fn persist_create_view(&self, stmt: &CreateView) -> Result<SqlResult> {
        let mut state = self.state.write();
        sqlengine::execute_ddl(&Statement::CreateView(stmt.clone()), &mut state)
    }

    /// Install a planner-built flow under a view name. The planner itself
    /// lives outside the core; it hands over the assembled operators.
    pub fn install_view(&self, view_name: &str, graph: GraphPartition) {
        let state = self.state.read();
        state.dataflow().add_flow(view_name, graph);
    }

    /// Handle to an installed flow, for keyed view lookups.
    pub fn view(&self, view_name: &str) -> Result<Arc<crate::dataflow::DataFlow>> {
        self.state.read().dataflow().flow(view_name)
    }

    /// Initialize a freshly installed view from the current contents of
    /// its inputs so it does not start empty. An input is either a base
    /// table or, through a forward-view binding, another view.
    pub fn backfill_view(&self, view_name: &str) -> Result<()> {
        let state = self.state.read();
        let flow = state.dataflow().flow(view_name)?;
        let mut session = state.database().session();
        session.begin_transaction(false);
        for input in flow.input_tables() {
            if state.sharder().table_exists(&input) {
                let records = session.get_all(&input)?.into_rows();
                flow.process_records(&input, records);
            } else if state.dataflow().has_flow(&input) {
                let records = state.dataflow().lookup_all(&input, None, 0)?;
                flow.process_records(&input, records);
            }
        }
        session.rollback_transaction()?;
        Ok(())
    }

    pub fn get_maximum_value(&self, table_name: &str, column_name: &str) -> Result<i64> {
        let state = self.state.read();
        state.database().get_maximum_value(table_name, column_name)
    }

    /// Live user counts per shard kind.
    pub fn num_shards(&self) -> HashMap<String, usize> {
        self.state.read().sharder().num_shards()
    }

    /// Per-view memory estimates.
    pub fn size_in_memory(&self) -> Vec<(String, u64)> {
        self.state.read().dataflow().size_in_memory()
    }
}
