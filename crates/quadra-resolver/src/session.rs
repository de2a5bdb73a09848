//! The client-facing handle: one coordinator, one set of security adapters.

use crate::answer::QueryAnswer;
use crate::coordinator::{SessionId, TransactionCoordinator};
use crate::database::DatabaseCore;
use crate::metadata::SystemNodes;
use crate::operations::{
    ApplyRulesOperation, BootstrapOperation, BuildRulesOperation, CreateDefaultGraphOperation,
    CreateGraphOperation, ExportOperation, GraphExistsOperation, LoginOperation, ModifyGraphOperation,
    Operation, PreallocateOperation, QueryOperation, RemoveGraphOperation, StatementSource,
};
use crate::query::Query;
use crate::rules::Rules;
use quadra_spi::{GlobalNode, NodeId, Result};
use std::io::Write;
use std::sync::Arc;

pub struct DatabaseSession {
    core: Arc<DatabaseCore>,
    coordinator: TransactionCoordinator,
}

impl DatabaseSession {
    pub(crate) fn new(core: Arc<DatabaseCore>) -> Result<Self> {
        let security = core.new_security_adapters()?;
        let coordinator = TransactionCoordinator::new(core.clone(), security);
        tracing::debug!(session = %coordinator.session_id(), "session opened");
        Ok(Self { core, coordinator })
    }

    pub fn id(&self) -> SessionId {
        self.coordinator.session_id()
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Runs `operation` in the session's current transaction, or a new one
    /// in auto-commit mode.
    pub fn execute(&self, operation: &mut dyn Operation) -> Result<()> {
        let transaction = self.coordinator.transaction(operation.is_write_operation())?;
        transaction.execute(operation, self.core.metadata())
    }

    pub(crate) fn bootstrap(&self) -> Result<SystemNodes> {
        let mut op = BootstrapOperation::new();
        self.execute(&mut op)?;
        op.system_nodes()
    }

    // ========================================================================
    // Graphs
    // ========================================================================

    pub fn create_graph(&self, graph_uri: &str, model_type: Option<&str>) -> Result<bool> {
        let mut op = CreateGraphOperation::new(graph_uri, model_type)?;
        self.execute(&mut op)?;
        op.created()
    }

    pub fn create_default_graph(&self, graph_uri: &str, model_type: &str) -> Result<bool> {
        let mut op = CreateDefaultGraphOperation::new(graph_uri, model_type)?;
        self.execute(&mut op)?;
        op.created()
    }

    pub fn remove_graph(&self, graph_uri: &str) -> Result<()> {
        let mut op = RemoveGraphOperation::new(graph_uri)?;
        self.execute(&mut op)?;
        op.result()
    }

    pub fn graph_exists(&self, graph_uri: &str) -> Result<bool> {
        let mut op = GraphExistsOperation::new(graph_uri)?;
        self.execute(&mut op)?;
        op.exists()
    }

    pub fn insert(&self, graph_uri: &str, statements: Vec<[GlobalNode; 3]>) -> Result<usize> {
        let mut op = ModifyGraphOperation::insert(graph_uri, statements)?;
        self.execute(&mut op)?;
        op.statement_count()
    }

    pub fn delete(&self, graph_uri: &str, statements: Vec<[GlobalNode; 3]>) -> Result<usize> {
        let mut op = ModifyGraphOperation::delete(graph_uri, statements)?;
        self.execute(&mut op)?;
        op.statement_count()
    }

    /// Inserts (or deletes) the rows of a three-column select.
    pub fn modify_from_query(&self, graph_uri: &str, query: Query, insert: bool) -> Result<usize> {
        let mut op = ModifyGraphOperation::new(graph_uri, StatementSource::Query(query), insert)?;
        self.execute(&mut op)?;
        op.statement_count()
    }

    pub fn preallocate(&self, node: GlobalNode) -> Result<NodeId> {
        let mut op = PreallocateOperation::new(node);
        self.execute(&mut op)?;
        op.node_id()
    }

    pub fn query(&self, query: Query) -> Result<QueryAnswer> {
        let mut op = QueryOperation::new(query);
        self.execute(&mut op)?;
        op.into_answer()
    }

    pub fn export<W: Write>(&self, graph_uri: &str, writer: W) -> Result<W> {
        let mut op = ExportOperation::new(graph_uri, writer)?;
        self.execute(&mut op)?;
        op.into_writer()
    }

    // ========================================================================
    // Rules
    // ========================================================================

    pub fn build_rules(&self, rule_graph: &str, base_graph: &str, destination_graph: &str) -> Result<Arc<dyn Rules>> {
        let mut op = BuildRulesOperation::new(
            self.core.rule_loader().clone(),
            rule_graph,
            base_graph,
            destination_graph,
        )?;
        self.execute(&mut op)?;
        op.rules()
    }

    pub fn apply_rules(&self, rules: Arc<dyn Rules>) -> Result<u64> {
        let mut op = ApplyRulesOperation::new(rules);
        self.execute(&mut op)?;
        op.inferred()
    }

    // ========================================================================
    // Security and transactions
    // ========================================================================

    pub fn login(&self, security_domain: &str, user: &str, password: &str) -> Result<()> {
        let mut op = LoginOperation::new(security_domain, user, password)?;
        self.execute(&mut op)?;
        op.result()
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.coordinator.set_auto_commit(auto_commit)
    }

    pub fn is_auto_commit(&self) -> bool {
        self.coordinator.is_auto_commit()
    }

    pub fn commit(&self) -> Result<()> {
        self.coordinator.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.coordinator.rollback()
    }

    /// Rolls back transactions idle longer than the configured timeout.
    pub fn reap_idle_transactions(&self) -> Result<usize> {
        self.coordinator.reap_idle(self.core.config().idle_timeout_ms)
    }

    pub fn close(&self) -> Result<()> {
        self.coordinator.close()
    }
}
