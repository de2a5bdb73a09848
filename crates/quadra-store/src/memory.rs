//! In-memory graph stores.
//!
//! A [`MemoryResolver`] keeps a private working copy of every graph it
//! touches and publishes the copies to the shared [`MemoryStore`] on commit,
//! so readers never observe uncommitted writes. Temporary stores use
//! [`StagingMode::Direct`] and write straight through.

use parking_lot::{Mutex, RwLock};
use quadra_spi::{
    Constraint, ConstraintElement, DefaultGraph, EnlistableResource, Error, GlobalNode, NodeId,
    Resolution, Resolver, ResolverFactory, ResolverSession, ResourceId, Result, Statement,
    SystemResolver, SystemResolverFactory, Tuples, Variable, RDF_TYPE,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphData {
    pub model_type: String,
    pub triples: BTreeSet<Statement>,
}

impl GraphData {
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
            triples: BTreeSet::new(),
        }
    }
}

/// Committed graphs keyed by graph node.
#[derive(Default)]
pub struct MemoryStore {
    graphs: RwLock<HashMap<NodeId, GraphData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self, graph: NodeId) -> Option<GraphData> {
        self.graphs.read().get(&graph).cloned()
    }

    pub fn contains(&self, graph: NodeId) -> bool {
        self.graphs.read().contains_key(&graph)
    }

    pub fn graph_count(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn statement_count(&self, graph: NodeId) -> usize {
        self.graphs
            .read()
            .get(&graph)
            .map_or(0, |g| g.triples.len())
    }

    pub fn clear(&self) {
        self.graphs.write().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    /// Writes stay private until commit.
    Transactional,
    /// Writes go straight to the store; commit and rollback do nothing.
    Direct,
}

// ============================================================================
// Resolver
// ============================================================================

pub struct MemoryResolver {
    id: ResourceId,
    store: Arc<MemoryStore>,
    can_write: bool,
    mode: StagingMode,
    /// Writes to a graph nobody created create it on the fly.
    implicit_graphs: bool,
    /// `None` marks a graph removed in this transaction.
    working: Mutex<HashMap<NodeId, Option<GraphData>>>,
}

impl MemoryResolver {
    pub fn new(store: Arc<MemoryStore>, can_write: bool, mode: StagingMode) -> Self {
        Self {
            id: ResourceId::new(),
            store,
            can_write,
            mode,
            implicit_graphs: false,
            working: Mutex::new(HashMap::new()),
        }
    }

    fn with_implicit_graphs(mut self, implicit: bool) -> Self {
        self.implicit_graphs = implicit;
        self
    }

    fn check_writable(&self) -> Result<()> {
        if self.can_write {
            Ok(())
        } else {
            Err(Error::Resolver("resolver opened read-only".into()))
        }
    }

    fn exists(&self, graph: NodeId) -> bool {
        match self.working.lock().get(&graph) {
            Some(entry) => entry.is_some(),
            None => self.store.contains(graph),
        }
    }

    fn view(&self, graph: NodeId) -> Option<GraphData> {
        match self.working.lock().get(&graph) {
            Some(entry) => entry.clone(),
            None => self.store.graph(graph),
        }
    }

    fn graph_ids(&self) -> Vec<NodeId> {
        let working = self.working.lock();
        let mut ids: BTreeSet<NodeId> = self.store.graphs.read().keys().copied().collect();
        for (id, entry) in working.iter() {
            if entry.is_some() {
                ids.insert(*id);
            } else {
                ids.remove(id);
            }
        }
        ids.into_iter().collect()
    }

    /// Applies `f` to a mutable copy of `graph`, creating it when implicit
    /// graphs are enabled.
    fn update(&self, graph: NodeId, f: impl FnOnce(&mut GraphData)) -> Result<()> {
        self.check_writable()?;
        match self.mode {
            StagingMode::Direct => {
                let mut graphs = self.store.graphs.write();
                if !graphs.contains_key(&graph) {
                    if !self.implicit_graphs {
                        return Err(missing_graph(graph));
                    }
                    graphs.insert(graph, GraphData::default());
                }
                if let Some(data) = graphs.get_mut(&graph) {
                    f(data);
                }
            }
            StagingMode::Transactional => {
                let mut working = self.working.lock();
                let entry = match working.get(&graph) {
                    Some(entry) => entry.clone(),
                    None => self.store.graph(graph),
                };
                let mut data = match entry {
                    Some(data) => data,
                    None if self.implicit_graphs => GraphData::default(),
                    None => return Err(missing_graph(graph)),
                };
                f(&mut data);
                working.insert(graph, Some(data));
            }
        }
        Ok(())
    }

    fn write_entry(&self, graph: NodeId, entry: Option<GraphData>) {
        match self.mode {
            StagingMode::Direct => {
                let mut graphs = self.store.graphs.write();
                match entry {
                    Some(data) => graphs.insert(graph, data),
                    None => graphs.remove(&graph),
                };
            }
            StagingMode::Transactional => {
                self.working.lock().insert(graph, entry);
            }
        }
    }
}

fn missing_graph(graph: NodeId) -> Error {
    Error::Resolver(format!("graph {graph} does not exist"))
}

/// Binds one statement against a constraint, producing a row over
/// `variables` or `None` when it does not match.
fn bind(
    constraint: &Constraint,
    variables: &[Variable],
    statement: &Statement,
    graph: NodeId,
) -> Result<Option<Vec<NodeId>>> {
    let values = [statement.subject, statement.predicate, statement.object, graph];
    let mut row = vec![NodeId::NONE; variables.len()];
    for (element, value) in constraint.elements().iter().zip(values) {
        match element {
            ConstraintElement::Local(id) => {
                if *id != value {
                    return Ok(None);
                }
            }
            ConstraintElement::Variable(var) => {
                let Some(column) = variables.iter().position(|v| v == var) else {
                    return Err(Error::Resolver(format!("unbound graph placeholder {var}")));
                };
                if row[column].is_none() {
                    row[column] = value;
                } else if row[column] != value {
                    return Ok(None);
                }
            }
            ConstraintElement::Global(node) => {
                return Err(Error::Resolver(format!("constraint element {node} was not localized")));
            }
        }
    }
    Ok(Some(row))
}

impl Resolver for MemoryResolver {
    fn create_model(&self, graph: NodeId, model_type: &str) -> Result<()> {
        self.check_writable()?;
        if self.exists(graph) {
            return Err(Error::Resolver(format!("graph {graph} already exists")));
        }
        self.write_entry(graph, Some(GraphData::new(model_type)));
        Ok(())
    }

    fn modify_model(&self, graph: NodeId, statements: &[Statement], occurs: bool) -> Result<()> {
        self.update(graph, |data| {
            for statement in statements {
                if occurs {
                    data.triples.insert(*statement);
                } else {
                    data.triples.remove(statement);
                }
            }
        })
    }

    fn remove_model(&self, graph: NodeId) -> Result<()> {
        self.check_writable()?;
        if !self.exists(graph) {
            return Err(missing_graph(graph));
        }
        self.write_entry(graph, None);
        Ok(())
    }

    fn resolve(&self, constraint: &Constraint) -> Result<Resolution> {
        let (graphs, complete) = match constraint.graph() {
            ConstraintElement::Local(graph) => (vec![*graph], true),
            ConstraintElement::Variable(var) if !var.is_from_clause() => (self.graph_ids(), false),
            other => {
                return Err(Error::Resolver(format!(
                    "cannot resolve against graph element {other:?}"
                )))
            }
        };

        let mut variables = constraint.variables();
        if let Some(var) = constraint.graph().as_variable() {
            if !variables.contains(var) {
                variables.push(var.clone());
            }
        }

        let mut rows = Vec::new();
        for graph in graphs {
            let Some(data) = self.view(graph) else {
                continue;
            };
            for statement in &data.triples {
                if let Some(row) = bind(constraint, &variables, statement, graph)? {
                    rows.push(row);
                }
            }
        }
        Ok(Resolution::new(
            constraint.clone(),
            Tuples::new(variables, rows)?,
            complete,
        ))
    }
}

impl EnlistableResource for MemoryResolver {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if self.mode == StagingMode::Direct {
            return Ok(());
        }
        let working = std::mem::take(&mut *self.working.lock());
        if working.is_empty() {
            return Ok(());
        }
        let mut graphs = self.store.graphs.write();
        for (graph, entry) in working {
            match entry {
                Some(data) => {
                    graphs.insert(graph, data);
                }
                None => {
                    graphs.remove(&graph);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.working.lock().clear();
        Ok(())
    }

    fn abort(&self) {
        self.working.lock().clear();
    }
}

// ============================================================================
// Factories
// ============================================================================

pub struct MemoryResolverFactory {
    store: Arc<MemoryStore>,
    model_types: Vec<String>,
    default_graphs: Vec<DefaultGraph>,
    mode: StagingMode,
    implicit_graphs: bool,
    closed: AtomicBool,
}

impl MemoryResolverFactory {
    /// Transactional store for graphs of `model_type`.
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            model_types: vec![model_type.into()],
            default_graphs: Vec::new(),
            mode: StagingMode::Transactional,
            implicit_graphs: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Write-through scratch store used to hold cached copies of graphs.
    pub fn temporary(model_type: impl Into<String>) -> Self {
        Self {
            mode: StagingMode::Direct,
            ..Self::new(model_type)
        }
    }

    /// Store addressed by graph URI scheme rather than model type. Any graph
    /// exists as soon as something writes to it.
    pub fn external() -> Self {
        Self {
            model_types: Vec::new(),
            implicit_graphs: true,
            ..Self::new(String::new())
        }
    }

    pub fn with_default_graph(mut self, graph_uri: &str, model_type: &str) -> Self {
        self.default_graphs.push(DefaultGraph {
            graph_uri: graph_uri.to_string(),
            model_type: model_type.to_string(),
        });
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Resolver("resolver factory is closed".into()))
        } else {
            Ok(())
        }
    }

    fn open_resolver(&self, can_write: bool) -> Result<MemoryResolver> {
        self.check_open()?;
        Ok(MemoryResolver::new(self.store.clone(), can_write, self.mode)
            .with_implicit_graphs(self.implicit_graphs))
    }
}

impl ResolverFactory for MemoryResolverFactory {
    fn new_resolver(
        &self,
        can_write: bool,
        _session: Arc<dyn ResolverSession>,
        _system_resolver: Arc<dyn SystemResolver>,
    ) -> Result<Arc<dyn Resolver>> {
        Ok(Arc::new(self.open_resolver(can_write)?))
    }

    fn model_types(&self) -> Vec<String> {
        self.model_types.clone()
    }

    fn default_graphs(&self) -> Vec<DefaultGraph> {
        self.default_graphs.clone()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.close()?;
        self.store.clear();
        Ok(())
    }
}

/// Resolver over the system graph. Ordinary graphs of the default model type
/// live in the same store.
pub struct MemorySystemResolver {
    resolver: MemoryResolver,
    session: Arc<dyn ResolverSession>,
}

impl Resolver for MemorySystemResolver {
    fn create_model(&self, graph: NodeId, model_type: &str) -> Result<()> {
        self.resolver.create_model(graph, model_type)
    }

    fn modify_model(&self, graph: NodeId, statements: &[Statement], occurs: bool) -> Result<()> {
        self.resolver.modify_model(graph, statements, occurs)
    }

    fn remove_model(&self, graph: NodeId) -> Result<()> {
        self.resolver.remove_model(graph)
    }

    fn resolve(&self, constraint: &Constraint) -> Result<Resolution> {
        self.resolver.resolve(constraint)
    }
}

impl EnlistableResource for MemorySystemResolver {
    fn resource_id(&self) -> ResourceId {
        self.resolver.resource_id()
    }

    fn prepare(&self) -> Result<()> {
        self.resolver.prepare()
    }

    fn commit(&self) -> Result<()> {
        self.resolver.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.resolver.rollback()
    }

    fn abort(&self) {
        self.resolver.abort()
    }
}

impl SystemResolver for MemorySystemResolver {
    fn create_system_model(&self, graph: NodeId, model_type: NodeId) -> Result<()> {
        let rdf_type = self
            .session
            .lookup_persistent(&GlobalNode::uri(RDF_TYPE))?
            .ok_or_else(|| Error::Localize(format!("{RDF_TYPE} has not been preallocated")))?;
        let type_uri = match self.session.globalize(model_type)? {
            GlobalNode::Uri(uri) => uri,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "system model type {other} is not a URI"
                )))
            }
        };
        self.resolver.create_model(graph, &type_uri)?;
        self.resolver
            .modify_model(graph, &[Statement::new(graph, rdf_type, model_type)], true)
    }
}

pub struct MemorySystemResolverFactory {
    inner: MemoryResolverFactory,
}

impl MemorySystemResolverFactory {
    /// `model_types` lists the system graph type and any ordinary graph types
    /// stored alongside it.
    pub fn new(model_types: Vec<String>) -> Self {
        let mut inner = MemoryResolverFactory::new(String::new());
        inner.model_types = model_types;
        Self { inner }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        self.inner.store()
    }
}

impl ResolverFactory for MemorySystemResolverFactory {
    fn new_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
        system_resolver: Arc<dyn SystemResolver>,
    ) -> Result<Arc<dyn Resolver>> {
        self.inner.new_resolver(can_write, session, system_resolver)
    }

    fn model_types(&self) -> Vec<String> {
        self.inner.model_types()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }
}

impl SystemResolverFactory for MemorySystemResolverFactory {
    fn new_system_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
    ) -> Result<Arc<dyn SystemResolver>> {
        Ok(Arc::new(MemorySystemResolver {
            resolver: self.inner.open_resolver(can_write)?,
            session,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(raw: i64) -> NodeId {
        NodeId::new(raw)
    }

    fn all(graph: impl Into<ConstraintElement>) -> Constraint {
        Constraint::new(
            ConstraintElement::var("s"),
            ConstraintElement::var("p"),
            ConstraintElement::var("o"),
            graph,
        )
    }

    #[test]
    fn test_writes_invisible_to_other_resolvers_until_commit() {
        let store = Arc::new(MemoryStore::new());
        let writer = MemoryResolver::new(store.clone(), true, StagingMode::Transactional);
        writer.create_model(n(10), "urn:type").unwrap();
        writer
            .modify_model(n(10), &[Statement::new(n(1), n(2), n(3))], true)
            .unwrap();

        let reader = MemoryResolver::new(store.clone(), false, StagingMode::Transactional);
        assert!(reader.resolve(&all(n(10))).unwrap().tuples.is_empty());
        assert_eq!(writer.resolve(&all(n(10))).unwrap().tuples.row_count(), 1);

        writer.commit().unwrap();
        assert_eq!(reader.resolve(&all(n(10))).unwrap().tuples.row_count(), 1);
        assert_eq!(store.statement_count(n(10)), 1);
    }

    #[test]
    fn test_rollback_discards_working_copy() {
        let store = Arc::new(MemoryStore::new());
        let writer = MemoryResolver::new(store.clone(), true, StagingMode::Transactional);
        writer.create_model(n(10), "urn:type").unwrap();
        writer.rollback().unwrap();
        writer.commit().unwrap();
        assert!(!store.contains(n(10)));
    }

    #[test]
    fn test_read_only_resolver_rejects_writes() {
        let store = Arc::new(MemoryStore::new());
        let reader = MemoryResolver::new(store, false, StagingMode::Transactional);
        assert!(matches!(reader.create_model(n(1), "t"), Err(Error::Resolver(_))));
    }

    #[test]
    fn test_bound_elements_and_repeated_variables_filter_rows() {
        let store = Arc::new(MemoryStore::new());
        let r = MemoryResolver::new(store, true, StagingMode::Direct);
        r.create_model(n(10), "t").unwrap();
        r.modify_model(
            n(10),
            &[
                Statement::new(n(1), n(2), n(1)),
                Statement::new(n(1), n(2), n(3)),
                Statement::new(n(4), n(5), n(6)),
            ],
            true,
        )
        .unwrap();

        let same = Constraint::new(
            ConstraintElement::var("x"),
            n(2),
            ConstraintElement::var("x"),
            n(10),
        );
        let resolution = r.resolve(&same).unwrap();
        assert_eq!(resolution.tuples.rows(), &[vec![n(1)]]);
        assert!(resolution.complete);
    }

    #[test]
    fn test_variable_graph_spans_all_graphs() {
        let store = Arc::new(MemoryStore::new());
        let r = MemoryResolver::new(store, true, StagingMode::Direct);
        for g in [10, 11] {
            r.create_model(n(g), "t").unwrap();
            r.modify_model(n(g), &[Statement::new(n(1), n(2), n(3))], true)
                .unwrap();
        }
        let resolution = r.resolve(&all(ConstraintElement::var("g"))).unwrap();
        assert_eq!(resolution.tuples.row_count(), 2);
        assert!(!resolution.complete);
        assert_eq!(resolution.tuples.variables().last(), Some(&Variable::new("g")));
    }

    #[test]
    fn test_external_store_creates_graphs_implicitly() {
        let factory = MemoryResolverFactory::external();
        let r = factory.open_resolver(true).unwrap();
        r.modify_model(n(7), &[Statement::new(n(1), n(2), n(3))], true)
            .unwrap();
        r.commit().unwrap();
        assert_eq!(factory.store().statement_count(n(7)), 1);
    }

    #[test]
    fn test_closed_factory_refuses_new_resolvers() {
        let factory = MemoryResolverFactory::new("urn:type");
        factory.close().unwrap();
        assert!(factory.open_resolver(false).is_err());
    }
}
