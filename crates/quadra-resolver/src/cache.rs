//! Per-transaction caching of external graphs.
//!
//! Graphs served by a cached URI scheme are copied into a temporary store the
//! first time a transaction touches them. Reads and writes then go to the
//! copy. Before commit, every changed copy is written back to the external
//! graph; on rollback the copies are simply discarded.
//!
//! ```text
//!   CacheResolver ── first touch ──► external.resolve(all) ──► temporary.create + insert
//!        │
//!        ├─ resolve ─────────────► temporary
//!        └─ modify ──────────────► temporary + mark changed
//! ```

use parking_lot::Mutex;
use quadra_spi::{
    Constraint, ConstraintElement, EnlistableResource, Error, NodeId, Resolution, Resolver,
    ResolverFactory, ResolverSession, ResourceId, Result, Statement, SystemResolver, Variable,
};
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// Cached and changed sets
// ============================================================================

#[derive(Debug, Default, Clone)]
struct CacheSets {
    cached: BTreeSet<NodeId>,
    /// Always a subset of `cached`.
    changed: BTreeSet<NodeId>,
}

/// Graphs copied into the temporary store by one transaction.
#[derive(Debug, Default)]
pub struct CachedGraphs {
    sets: Mutex<CacheSets>,
}

impl CachedGraphs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self, graph: NodeId) -> bool {
        self.sets.lock().cached.contains(&graph)
    }

    pub fn is_changed(&self, graph: NodeId) -> bool {
        self.sets.lock().changed.contains(&graph)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.lock().cached.is_empty()
    }

    pub fn mark_cached(&self, graph: NodeId) {
        self.sets.lock().cached.insert(graph);
    }

    pub fn mark_changed(&self, graph: NodeId) -> Result<()> {
        let mut sets = self.sets.lock();
        if !sets.cached.contains(&graph) {
            return Err(Error::invalid_state(format!(
                "graph {graph} marked changed but was never cached"
            )));
        }
        sets.changed.insert(graph);
        Ok(())
    }

    pub fn cached(&self) -> Vec<NodeId> {
        self.sets.lock().cached.iter().copied().collect()
    }

    pub fn changed(&self) -> Vec<NodeId> {
        self.sets.lock().changed.iter().copied().collect()
    }

    fn take(&self) -> CacheSets {
        std::mem::take(&mut *self.sets.lock())
    }

    /// Writes every changed graph through `write_back`, then drops all copies
    /// from `temporary`. Both sets are empty afterwards, even on error.
    pub fn flush(
        &self,
        temporary: &dyn Resolver,
        mut write_back: impl FnMut(NodeId, &[Statement]) -> Result<()>,
    ) -> Result<()> {
        let sets = self.take();
        let mut first_error = None;
        for graph in &sets.cached {
            if sets.changed.contains(graph) && first_error.is_none() {
                let outcome = graph_statements(temporary, *graph)
                    .and_then(|statements| write_back(*graph, &statements));
                if let Err(err) = outcome {
                    tracing::warn!(graph = %graph, error = %err, "write-back of cached graph failed");
                    first_error = Some(err);
                }
            }
            if let Err(err) = temporary.remove_model(*graph) {
                tracing::warn!(graph = %graph, error = %err, "failed to drop cached copy");
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drops every copy without writing anything back.
    pub fn discard(&self, temporary: &dyn Resolver) {
        let sets = self.take();
        for graph in sets.cached {
            if let Err(err) = temporary.remove_model(graph) {
                tracing::warn!(graph = %graph, error = %err, "failed to drop cached copy");
            }
        }
    }
}

/// Every statement of `graph` as seen by `resolver`.
pub fn graph_statements(resolver: &dyn Resolver, graph: NodeId) -> Result<Vec<Statement>> {
    let constraint = Constraint::new(
        ConstraintElement::var("s"),
        ConstraintElement::var("p"),
        ConstraintElement::var("o"),
        graph,
    );
    let tuples = resolver.resolve(&constraint)?.tuples;
    let column = |name: &str| {
        tuples
            .column_index(&Variable::new(name))
            .ok_or_else(|| Error::Resolver(format!("resolution lacks column ?{name}")))
    };
    let (s, p, o) = (column("s")?, column("p")?, column("o")?);
    Ok(tuples
        .rows()
        .iter()
        .map(|row| Statement::new(row[s], row[p], row[o]))
        .collect())
}

// ============================================================================
// Caching factory and resolver
// ============================================================================

/// Serves an external factory's graphs through transaction-local copies.
///
/// Every resolver it hands out shares `external`, the one resolver the
/// transaction obtained and enlisted for the external factory. Write-back
/// goes through that same resolver, so the external store sees a single
/// participant.
pub struct CacheResolverFactory {
    external: Arc<dyn Resolver>,
    external_exports: bool,
    temporary: Arc<dyn ResolverFactory>,
    graphs: Arc<CachedGraphs>,
    temporary_type: String,
}

impl CacheResolverFactory {
    pub fn new(
        external: Arc<dyn Resolver>,
        external_exports: bool,
        temporary: Arc<dyn ResolverFactory>,
        graphs: Arc<CachedGraphs>,
        temporary_type: impl Into<String>,
    ) -> Self {
        Self {
            external,
            external_exports,
            temporary,
            graphs,
            temporary_type: temporary_type.into(),
        }
    }
}

impl ResolverFactory for CacheResolverFactory {
    fn new_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
        system_resolver: Arc<dyn SystemResolver>,
    ) -> Result<Arc<dyn Resolver>> {
        let temporary = self.temporary.new_resolver(true, session, system_resolver)?;
        Ok(Arc::new(CacheResolver {
            id: ResourceId::new(),
            can_write,
            external: self.external.clone(),
            temporary,
            graphs: self.graphs.clone(),
            temporary_type: self.temporary_type.clone(),
        }))
    }

    fn supports_export(&self) -> bool {
        self.external_exports
    }

    // The wrapped factories outlive this decorator.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        Ok(())
    }
}

pub struct CacheResolver {
    id: ResourceId,
    can_write: bool,
    external: Arc<dyn Resolver>,
    temporary: Arc<dyn Resolver>,
    graphs: Arc<CachedGraphs>,
    temporary_type: String,
}

impl CacheResolver {
    fn ensure_cached(&self, graph: NodeId) -> Result<()> {
        if self.graphs.is_cached(graph) {
            return Ok(());
        }
        let statements = graph_statements(self.external.as_ref(), graph)?;
        self.temporary.create_model(graph, &self.temporary_type)?;
        if !statements.is_empty() {
            if let Err(err) = self.temporary.modify_model(graph, &statements, true) {
                if let Err(cleanup) = self.temporary.remove_model(graph) {
                    tracing::warn!(graph = %graph, error = %cleanup, "failed to drop partial cached copy");
                }
                return Err(err);
            }
        }
        tracing::debug!(graph = %graph, statements = statements.len(), "cached external graph");
        self.graphs.mark_cached(graph);
        Ok(())
    }

    fn named_graph(constraint: &Constraint) -> Result<NodeId> {
        constraint.graph().as_local().ok_or_else(|| {
            Error::Resolver("cached graphs can only be resolved by name".into())
        })
    }
}

impl Resolver for CacheResolver {
    fn create_model(&self, _graph: NodeId, _model_type: &str) -> Result<()> {
        Err(Error::Resolver("Cached content can't be created".into()))
    }

    fn modify_model(&self, graph: NodeId, statements: &[Statement], occurs: bool) -> Result<()> {
        if !self.can_write {
            return Err(Error::Resolver("resolver opened read-only".into()));
        }
        self.ensure_cached(graph)?;
        self.temporary.modify_model(graph, statements, occurs)?;
        self.graphs.mark_changed(graph)
    }

    fn remove_model(&self, _graph: NodeId) -> Result<()> {
        Err(Error::Resolver("Cached content can't be removed".into()))
    }

    fn resolve(&self, constraint: &Constraint) -> Result<Resolution> {
        let graph = Self::named_graph(constraint)?;
        self.ensure_cached(graph)?;
        self.temporary.resolve(constraint)
    }
}

// The shared external resolver is enlisted on its own; the copies are
// dropped when the transaction's context is cleared.
impl EnlistableResource for CacheResolver {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self) {}
}
