//! The per-transaction view of the database that operations run against.
//!
//! ```text
//!   Operation ──► DatabaseOperationContext
//!                   ├─ find_model_resolver_factory ─► internal (by type) | external (by scheme)
//!                   │                                               └─► CacheResolverFactory
//!                   ├─ obtain_resolver ─► new_resolver + Transaction::enlist (memoized per factory)
//!                   ├─ resolve ─► canonical graph ─► security ─► Resolver::resolve
//!                   └─ do_query ─► QueryEvaluator ─► TransactionalAnswer
//! ```
//!
//! Resolvers are only ever created through [`OperationContext::obtain_resolver`],
//! which enlists them in the owning transaction.

use crate::answer::{AnswerSlot, QueryAnswer, TransactionalAnswer, TuplesAnswer};
use crate::cache::{graph_statements, CacheResolverFactory, CachedGraphs};
use crate::database::DatabaseCore;
use crate::query::{Query, QueryKind};
use crate::registry::ConstraintRegistry;
use crate::security;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use quadra_spi::{
    Constraint, ConstraintElement, EnlistableSession, Error, GlobalNode, NodeId, Resolver,
    ResolverFactory, ResolverSession, Result, SecurityAdapter, Statement, SystemResolver, Tuples,
    Variable,
};
use quadra_store::{MemoryResolverFactory, PersistentResolverSession};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

/// What an operation may do while it executes.
pub trait OperationContext {
    /// Factory holding `graph`: the internal factory for its recorded model
    /// type, else the external factory registered for its URI scheme.
    fn find_model_resolver_factory(&self, graph: NodeId) -> Result<Arc<dyn ResolverFactory>>;

    /// `None` when no internal factory stores graphs of `model_type`.
    fn find_model_type_resolver_factory(
        &self,
        model_type: &str,
    ) -> Result<Option<Arc<dyn ResolverFactory>>>;

    /// Resolver from `factory`, enlisted in the current transaction. Repeated
    /// calls with the same factory return the same resolver.
    fn obtain_resolver(&self, factory: &Arc<dyn ResolverFactory>) -> Result<Arc<dyn Resolver>>;

    /// Maps host aliases of this database onto its canonical graph node.
    fn canonical_model(&self, graph: NodeId) -> Result<NodeId>;

    fn resolve(&self, constraint: &Constraint) -> Result<Tuples>;

    fn do_query(&self, query: &Query) -> Result<QueryAnswer>;

    fn security_adapters(&self) -> &[Arc<dyn SecurityAdapter>];

    fn session(&self) -> Arc<dyn ResolverSession>;

    /// Model type recorded for `graph` in the system graph.
    fn graph_type(&self, graph: NodeId) -> Result<Option<String>>;

    /// Drops any cached type for `graph` after it was removed.
    fn forget_graph_type(&self, graph: NodeId);

    fn constraint_registry(&self) -> &ConstraintRegistry;
}

#[derive(Default)]
struct ContextState {
    system_resolver: Option<Arc<dyn SystemResolver>>,
    /// Keyed by factory address.
    resolvers: HashMap<usize, Arc<dyn Resolver>>,
    cache_factories: HashMap<String, Arc<dyn ResolverFactory>>,
    graph_types: HashMap<NodeId, String>,
    answers: Vec<Weak<AnswerSlot>>,
}

pub struct DatabaseOperationContext {
    core: Arc<DatabaseCore>,
    transaction: Weak<Transaction>,
    session: Arc<dyn EnlistableSession>,
    resolver_session: Arc<dyn ResolverSession>,
    security: Arc<[Arc<dyn SecurityAdapter>]>,
    writing: bool,
    cached_graphs: Arc<CachedGraphs>,
    temporary_factory: Arc<dyn ResolverFactory>,
    state: Mutex<ContextState>,
}

fn factory_key(factory: &Arc<dyn ResolverFactory>) -> usize {
    Arc::as_ptr(factory) as *const () as usize
}

impl DatabaseOperationContext {
    pub(crate) fn new(
        core: Arc<DatabaseCore>,
        transaction: Weak<Transaction>,
        session: Arc<dyn EnlistableSession>,
        security: Arc<[Arc<dyn SecurityAdapter>]>,
        writing: bool,
    ) -> Self {
        let temporary_factory: Arc<dyn ResolverFactory> = Arc::new(MemoryResolverFactory::temporary(
            core.metadata().temporary_graph_type(),
        ));
        Self {
            resolver_session: session.clone(),
            core,
            transaction,
            session,
            security,
            writing,
            cached_graphs: Arc::new(CachedGraphs::new()),
            temporary_factory,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn cached_graphs(&self) -> &CachedGraphs {
        &self.cached_graphs
    }

    fn transaction(&self) -> Result<Arc<Transaction>> {
        self.transaction
            .upgrade()
            .ok_or_else(|| Error::invalid_state("operation context outlived its transaction"))
    }

    pub fn system_resolver(&self) -> Result<Arc<dyn SystemResolver>> {
        self.state
            .lock()
            .system_resolver
            .clone()
            .ok_or_else(|| Error::invalid_state("operation context has not been initiated"))
    }

    // ========================================================================
    // Lifecycle, driven by the transaction
    // ========================================================================

    /// Enlists the session and opens the system resolver. Called once, when
    /// the transaction first becomes active.
    pub(crate) fn initiate(&self) -> Result<()> {
        let transaction = self.transaction()?;
        transaction.enlist(self.session.clone())?;
        let persistent: Arc<dyn ResolverSession> =
            Arc::new(PersistentResolverSession::new(self.resolver_session.clone()));
        let system = self
            .core
            .system_factory()
            .new_system_resolver(self.writing, persistent)?;
        transaction.enlist(system.clone())?;
        self.state.lock().system_resolver = Some(system);
        tracing::trace!(tx = %transaction.id(), writing = self.writing, "operation context initiated");
        Ok(())
    }

    /// Writes changed cached graphs back to their external stores.
    pub(crate) fn prepare_commit(&self) -> Result<()> {
        if self.cached_graphs.is_empty() {
            return Ok(());
        }
        let temporary = self.temporary_resolver()?;
        if !self.writing {
            self.cached_graphs.discard(temporary.as_ref());
            return Ok(());
        }
        self.cached_graphs
            .flush(temporary.as_ref(), |graph, statements| self.write_back(graph, statements))
    }

    /// Force-closes registered answers, discards cached copies and releases
    /// every resolver. Called when the transaction finishes either way.
    pub(crate) fn clear(&self) -> Result<()> {
        let answers = std::mem::take(&mut self.state.lock().answers);
        let mut first_error = None;
        for slot in answers.iter().filter_map(Weak::upgrade) {
            if let Err(err) = slot.session_close() {
                tracing::warn!(error = %err, "failed to force-close answer");
                first_error.get_or_insert(err);
            }
        }
        if !self.cached_graphs.is_empty() {
            match self.temporary_resolver() {
                Ok(temporary) => self.cached_graphs.discard(temporary.as_ref()),
                Err(err) => tracing::warn!(error = %err, "cannot discard cached graphs"),
            }
        }
        *self.state.lock() = ContextState::default();
        first_error.map_or(Ok(()), Err)
    }

    fn temporary_resolver(&self) -> Result<Arc<dyn Resolver>> {
        let system = self.system_resolver()?;
        self.temporary_factory
            .new_resolver(true, self.resolver_session.clone(), system)
    }

    /// Makes the external copy of `graph` equal to `statements`.
    fn write_back(&self, graph: NodeId, statements: &[Statement]) -> Result<()> {
        let (uri, scheme) = self.graph_scheme(graph)?;
        let factory = self
            .core
            .external_factory(&scheme)?
            .ok_or_else(|| Error::NoSuchGraph(uri.clone()))?;
        let resolver = self.obtain_resolver(&factory)?;
        let wanted: BTreeSet<Statement> = statements.iter().copied().collect();
        let stale: Vec<Statement> = graph_statements(resolver.as_ref(), graph)?
            .into_iter()
            .filter(|s| !wanted.contains(s))
            .collect();
        if !stale.is_empty() {
            resolver.modify_model(graph, &stale, false)?;
        }
        resolver.modify_model(graph, statements, true)?;
        tracing::debug!(graph = %uri, statements = statements.len(), removed = stale.len(), "wrote back cached graph");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn graph_scheme(&self, graph: NodeId) -> Result<(String, String)> {
        let node = self.resolver_session.globalize(graph)?;
        let Some(uri) = node.as_uri() else {
            return Err(Error::NoSuchGraph(node.to_string()));
        };
        let scheme = url::Url::parse(uri)
            .map(|u| u.scheme().to_string())
            .map_err(|_| Error::NoSuchGraph(uri.to_string()))?;
        Ok((uri.to_string(), scheme))
    }

    /// The caching decorator for `scheme`, wrapping this transaction's
    /// resolver for the external factory. Write-back later obtains that same
    /// resolver, so the external store is enlisted once.
    fn cache_factory(
        &self,
        scheme: &str,
        external: &Arc<dyn ResolverFactory>,
    ) -> Result<Arc<dyn ResolverFactory>> {
        if let Some(factory) = self.state.lock().cache_factories.get(scheme) {
            return Ok(factory.clone());
        }
        let external_resolver = self.obtain_resolver(external)?;
        let factory: Arc<dyn ResolverFactory> = Arc::new(CacheResolverFactory::new(
            external_resolver,
            external.supports_export(),
            self.temporary_factory.clone(),
            self.cached_graphs.clone(),
            self.core.metadata().temporary_graph_type(),
        ));
        Ok(self
            .state
            .lock()
            .cache_factories
            .entry(scheme.to_string())
            .or_insert(factory)
            .clone())
    }

    /// Replaces global elements with local ids. `None` when some node is
    /// unknown, so nothing can match.
    fn localize_constraint(&self, constraint: &Constraint) -> Result<Option<Constraint>> {
        let mut elements = constraint.elements().clone();
        for (position, element) in elements.iter_mut().enumerate() {
            let ConstraintElement::Global(node) = element else {
                continue;
            };
            match self.resolver_session.lookup(node)? {
                Some(id) => *element = ConstraintElement::Local(id),
                None if position == 3 => {
                    return Err(Error::NoSuchGraph(
                        node.as_uri().map_or_else(|| node.to_string(), str::to_string),
                    ))
                }
                None => return Ok(None),
            }
        }
        Ok(Some(Constraint::with_elements(elements)))
    }

    fn resolve_in_graph(&self, graph: NodeId, constraint: &Constraint) -> Result<Tuples> {
        let canonical = self.canonical_model(graph)?;
        let session = self.resolver_session.as_ref();
        security::check_visible(&self.security, canonical, session)?;
        if !security::can_resolve(&self.security, canonical, session)? {
            return Ok(Tuples::empty(constraint.variables()));
        }
        let constraint = if canonical != graph {
            constraint.with_graph(canonical)
        } else {
            constraint.clone()
        };
        let factory = self.find_model_resolver_factory(canonical)?;
        let resolver = self.obtain_resolver(&factory)?;
        Ok(resolver.resolve(&constraint)?.tuples)
    }

    /// Appends the resolutions of every internal factory, stopping at the
    /// first complete one. Rows in graphs the caller may not see are dropped.
    fn resolve_any_graph(&self, graph_var: &Variable, constraint: &Constraint) -> Result<Tuples> {
        let mut result: Option<Tuples> = None;
        for factory in self.core.internal_factories() {
            let resolver = self.obtain_resolver(factory)?;
            let resolution = resolver.resolve(constraint)?;
            let tuples = self.visible_rows(graph_var, resolution.tuples)?;
            if resolution.complete {
                return Ok(tuples);
            }
            result = Some(match result {
                Some(acc) => acc.append(&tuples),
                None => tuples,
            });
        }
        Ok(result.unwrap_or_else(|| Tuples::empty(constraint.variables())))
    }

    fn visible_rows(&self, graph_var: &Variable, tuples: Tuples) -> Result<Tuples> {
        let Some(column) = tuples.column_index(graph_var) else {
            return Ok(tuples);
        };
        let session = self.resolver_session.as_ref();
        let mut verdicts: HashMap<NodeId, bool> = HashMap::new();
        let mut rows = Vec::with_capacity(tuples.row_count());
        for row in tuples.rows() {
            let graph = row[column];
            let visible = match verdicts.get(&graph) {
                Some(v) => *v,
                None => {
                    let v = security::check_visible(&self.security, graph, session).is_ok()
                        && security::can_resolve(&self.security, graph, session)?;
                    verdicts.insert(graph, v);
                    v
                }
            };
            if visible {
                rows.push(row.clone());
            }
        }
        Tuples::new(tuples.variables().to_vec(), rows)
    }

    fn register_answer(&self, answer: &TransactionalAnswer) {
        let mut state = self.state.lock();
        state.answers.retain(|slot| slot.strong_count() > 0);
        state.answers.push(Arc::downgrade(answer.slot()));
    }
}

impl OperationContext for DatabaseOperationContext {
    fn find_model_resolver_factory(&self, graph: NodeId) -> Result<Arc<dyn ResolverFactory>> {
        if let Some(model_type) = self.graph_type(graph)? {
            return self.core.internal_factory(&model_type).ok_or_else(|| {
                Error::UnsupportedModelType(format!(
                    "{model_type} (graph {})",
                    security::graph_label(graph, self.resolver_session.as_ref())
                ))
            });
        }
        let (uri, scheme) = self.graph_scheme(graph)?;
        let Some(external) = self.core.external_factory(&scheme)? else {
            return Err(Error::NoSuchGraph(uri));
        };
        if self.core.is_cached_scheme(&scheme) {
            self.cache_factory(&scheme, &external)
        } else {
            Ok(external)
        }
    }

    fn find_model_type_resolver_factory(
        &self,
        model_type: &str,
    ) -> Result<Option<Arc<dyn ResolverFactory>>> {
        Ok(self.core.internal_factory(model_type))
    }

    fn obtain_resolver(&self, factory: &Arc<dyn ResolverFactory>) -> Result<Arc<dyn Resolver>> {
        let key = factory_key(factory);
        if let Some(resolver) = self.state.lock().resolvers.get(&key) {
            return Ok(resolver.clone());
        }
        let system = self.system_resolver()?;
        let resolver = factory.new_resolver(self.writing, self.resolver_session.clone(), system)?;
        self.transaction()?.enlist(resolver.clone())?;
        self.state.lock().resolvers.insert(key, resolver.clone());
        Ok(resolver)
    }

    fn canonical_model(&self, graph: NodeId) -> Result<NodeId> {
        let metadata = self.core.metadata();
        if metadata.hostname_aliases().is_empty() {
            return Ok(graph);
        }
        let node = match self.resolver_session.globalize(graph) {
            Ok(node) => node,
            Err(Error::Globalize(_)) => return Ok(graph),
            Err(err) => return Err(err),
        };
        let Some(Ok(mut url)) = node.as_uri().map(url::Url::parse) else {
            return Ok(graph);
        };
        let canonical_host = url::Url::parse(metadata.database_uri())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        let (Some(host), Some(canonical_host)) = (url.host_str(), canonical_host) else {
            return Ok(graph);
        };
        if host == canonical_host || !metadata.hostname_aliases().iter().any(|a| a == host) {
            return Ok(graph);
        }
        if url.set_host(Some(&canonical_host)).is_err() {
            return Ok(graph);
        }
        let canonical = self
            .resolver_session
            .lookup_persistent(&GlobalNode::uri(url.as_str()))?;
        if canonical.is_some() {
            tracing::trace!(alias = %node, canonical = %url, "canonicalized graph alias");
        }
        Ok(canonical.unwrap_or(graph))
    }

    fn resolve(&self, constraint: &Constraint) -> Result<Tuples> {
        let Some(localized) = self.localize_constraint(constraint)? else {
            return Ok(Tuples::empty(constraint.variables()));
        };
        match localized.graph() {
            ConstraintElement::Local(graph) => self.resolve_in_graph(*graph, &localized),
            ConstraintElement::Variable(v) if v.is_from_clause() => Err(Error::Query(
                "pattern was resolved without a graph expression".into(),
            )),
            ConstraintElement::Variable(v) => self.resolve_any_graph(v, &localized),
            ConstraintElement::Global(node) => {
                Err(Error::invalid_state(format!("graph {node} was not localized")))
            }
        }
    }

    fn do_query(&self, query: &Query) -> Result<QueryAnswer> {
        let tuples = self.core.evaluator().evaluate(self, query)?;
        match query.kind {
            QueryKind::Ask => Ok(QueryAnswer::Boolean(!tuples.is_empty())),
            QueryKind::Select => {
                let cursor = TuplesAnswer::new(tuples, self.resolver_session.clone());
                let answer = TransactionalAnswer::new(self.transaction()?, Box::new(cursor))?;
                self.register_answer(&answer);
                Ok(QueryAnswer::Rows(answer))
            }
        }
    }

    fn security_adapters(&self) -> &[Arc<dyn SecurityAdapter>] {
        &self.security
    }

    fn session(&self) -> Arc<dyn ResolverSession> {
        self.resolver_session.clone()
    }

    fn graph_type(&self, graph: NodeId) -> Result<Option<String>> {
        if let Some(model_type) = self.state.lock().graph_types.get(&graph) {
            return Ok(Some(model_type.clone()));
        }
        let nodes = self.core.metadata().system_nodes()?;
        let system = self.system_resolver()?;
        let tuples = system
            .resolve(&Constraint::new(
                graph,
                nodes.rdf_type,
                ConstraintElement::var("type"),
                nodes.system_graph,
            ))?
            .tuples;
        let (Some(column), Some(row)) = (tuples.column_index(&Variable::new("type")), tuples.rows().first())
        else {
            return Ok(None);
        };
        let model_type = match self.resolver_session.globalize(row[column])? {
            GlobalNode::Uri(uri) => uri,
            other => {
                return Err(Error::Resolver(format!("model type {other} is not a URI")));
            }
        };
        self.state.lock().graph_types.insert(graph, model_type.clone());
        Ok(Some(model_type))
    }

    fn forget_graph_type(&self, graph: NodeId) {
        self.state.lock().graph_types.remove(&graph);
    }

    fn constraint_registry(&self) -> &ConstraintRegistry {
        self.core.registry()
    }
}
