//! Decorator for factories that store graphs by model type.
//!
//! Creating or removing a graph through an [`InternalResolver`] also records
//! or erases its `<graph> rdf:type <model type>` statement in the system
//! graph, using the node ids bootstrap preallocated.

use crate::metadata::DatabaseMetadata;
use quadra_spi::{
    Constraint, ConstraintElement, DefaultGraph, EnlistableResource, GlobalNode, NodeId, Resolution,
    Resolver, ResolverFactory, ResolverSession, ResourceId, Result, Statement, SystemResolver,
    Variable,
};
use std::sync::Arc;

/// How an [`InternalResolverFactory`] obtains its delegate resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateMode {
    /// Ask the wrapped factory for a fresh resolver.
    ConstructNew,
    /// The wrapped factory is the system factory; reuse the transaction's
    /// system resolver instead of opening a second one.
    ReuseSystemResolver,
}

pub struct InternalResolverFactory {
    delegate: Arc<dyn ResolverFactory>,
    mode: DelegateMode,
    metadata: Arc<DatabaseMetadata>,
}

impl InternalResolverFactory {
    pub fn new(
        delegate: Arc<dyn ResolverFactory>,
        mode: DelegateMode,
        metadata: Arc<DatabaseMetadata>,
    ) -> Self {
        Self {
            delegate,
            mode,
            metadata,
        }
    }

    pub fn mode(&self) -> DelegateMode {
        self.mode
    }
}

impl ResolverFactory for InternalResolverFactory {
    fn new_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
        system_resolver: Arc<dyn SystemResolver>,
    ) -> Result<Arc<dyn Resolver>> {
        let nodes = self.metadata.system_nodes()?;
        let delegate: Arc<dyn Resolver> = match self.mode {
            DelegateMode::ConstructNew => {
                self.delegate
                    .new_resolver(can_write, session.clone(), system_resolver.clone())?
            }
            DelegateMode::ReuseSystemResolver => system_resolver.clone() as Arc<dyn Resolver>,
        };
        Ok(Arc::new(InternalResolver {
            delegate,
            system_resolver,
            session,
            rdf_type: nodes.rdf_type,
            system_graph: nodes.system_graph,
        }))
    }

    fn model_types(&self) -> Vec<String> {
        self.delegate.model_types()
    }

    fn default_graphs(&self) -> Vec<DefaultGraph> {
        self.delegate.default_graphs()
    }

    fn supports_export(&self) -> bool {
        self.delegate.supports_export()
    }

    fn close(&self) -> Result<()> {
        self.delegate.close()
    }

    fn delete(&self) -> Result<()> {
        self.delegate.delete()
    }
}

pub struct InternalResolver {
    delegate: Arc<dyn Resolver>,
    system_resolver: Arc<dyn SystemResolver>,
    session: Arc<dyn ResolverSession>,
    rdf_type: NodeId,
    system_graph: NodeId,
}

impl InternalResolver {
    fn type_statements(&self, graph: NodeId) -> Result<Vec<Statement>> {
        let constraint = Constraint::new(
            graph,
            self.rdf_type,
            ConstraintElement::var("type"),
            self.system_graph,
        );
        let tuples = self.system_resolver.resolve(&constraint)?.tuples;
        let column = tuples.column_index(&Variable::new("type"));
        Ok(tuples
            .rows()
            .iter()
            .filter_map(|row| column.map(|c| row[c]))
            .map(|ty| Statement::new(graph, self.rdf_type, ty))
            .collect())
    }
}

impl Resolver for InternalResolver {
    fn create_model(&self, graph: NodeId, model_type: &str) -> Result<()> {
        let type_node = self.session.localize_persistent(&GlobalNode::uri(model_type))?;
        self.delegate.create_model(graph, model_type)?;
        self.system_resolver.modify_model(
            self.system_graph,
            &[Statement::new(graph, self.rdf_type, type_node)],
            true,
        )
    }

    fn modify_model(&self, graph: NodeId, statements: &[Statement], occurs: bool) -> Result<()> {
        self.delegate.modify_model(graph, statements, occurs)
    }

    fn remove_model(&self, graph: NodeId) -> Result<()> {
        let types = self.type_statements(graph)?;
        self.delegate.remove_model(graph)?;
        if !types.is_empty() {
            self.system_resolver
                .modify_model(self.system_graph, &types, false)?;
        }
        Ok(())
    }

    fn resolve(&self, constraint: &Constraint) -> Result<Resolution> {
        self.delegate.resolve(constraint)
    }
}

/// Shares the delegate's identity, so enlisting both is a no-op the second
/// time.
impl EnlistableResource for InternalResolver {
    fn resource_id(&self) -> ResourceId {
        self.delegate.resource_id()
    }

    fn prepare(&self) -> Result<()> {
        self.delegate.prepare()
    }

    fn commit(&self) -> Result<()> {
        self.delegate.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.delegate.rollback()
    }

    fn abort(&self) {
        self.delegate.abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::metadata::SystemNodes;
    use quadra_spi::{SystemResolverFactory, RDF_TYPE};
    use quadra_store::{MemoryResolverFactory, MemorySystemResolverFactory, NodePool, StringPoolSession};

    struct Fixture {
        session: Arc<StringPoolSession>,
        system: Arc<dyn SystemResolver>,
        metadata: Arc<DatabaseMetadata>,
        nodes: SystemNodes,
    }

    fn fixture() -> Fixture {
        let config = DatabaseConfig::default();
        let session = Arc::new(StringPoolSession::new(Arc::new(NodePool::new()), true));
        let nodes = SystemNodes {
            rdf_type: session.localize_persistent(&GlobalNode::uri(RDF_TYPE)).unwrap(),
            system_graph: session
                .localize_persistent(&GlobalNode::uri(config.system_graph_uri()))
                .unwrap(),
            system_graph_type: session
                .localize_persistent(&GlobalNode::uri(config.system_graph_type.as_str()))
                .unwrap(),
        };
        let system = MemorySystemResolverFactory::new(vec![config.system_graph_type.clone()])
            .new_system_resolver(true, session.clone())
            .unwrap();
        system
            .create_system_model(nodes.system_graph, nodes.system_graph_type)
            .unwrap();
        let metadata = Arc::new(DatabaseMetadata::new(&config));
        metadata.initialize_system_nodes(nodes).unwrap();
        Fixture {
            session,
            system,
            metadata,
            nodes,
        }
    }

    impl Fixture {
        fn type_rows(&self, graph: NodeId) -> usize {
            let c = Constraint::new(
                graph,
                self.nodes.rdf_type,
                ConstraintElement::var("t"),
                self.nodes.system_graph,
            );
            self.system.resolve(&c).unwrap().tuples.row_count()
        }
    }

    #[test]
    fn test_create_and_remove_maintain_type_statement() {
        let f = fixture();
        let factory = InternalResolverFactory::new(
            Arc::new(MemoryResolverFactory::new("urn:t1")),
            DelegateMode::ConstructNew,
            f.metadata.clone(),
        );
        let resolver = factory
            .new_resolver(true, f.session.clone(), f.system.clone())
            .unwrap();
        let graph = f.session.localize_persistent(&GlobalNode::uri("urn:g1")).unwrap();

        resolver.create_model(graph, "urn:t1").unwrap();
        assert_eq!(f.type_rows(graph), 1);
        resolver.remove_model(graph).unwrap();
        assert_eq!(f.type_rows(graph), 0);
    }

    #[test]
    fn test_reuse_mode_shares_system_resolver_identity() {
        let f = fixture();
        let factory = InternalResolverFactory::new(
            Arc::new(MemoryResolverFactory::new("urn:unused")),
            DelegateMode::ReuseSystemResolver,
            f.metadata.clone(),
        );
        let resolver = factory
            .new_resolver(true, f.session.clone(), f.system.clone())
            .unwrap();
        assert_eq!(resolver.resource_id(), f.system.resource_id());
    }

    #[test]
    fn test_requires_bootstrapped_metadata() {
        let f = fixture();
        let unbooted = Arc::new(DatabaseMetadata::new(&DatabaseConfig::default()));
        let factory = InternalResolverFactory::new(
            Arc::new(MemoryResolverFactory::new("urn:t1")),
            DelegateMode::ConstructNew,
            unbooted,
        );
        let err = factory
            .new_resolver(true, f.session.clone(), f.system.clone())
            .err()
            .unwrap();
        assert!(err.is_invalid_state());
    }
}
