use super::{graph_node, require_graph_uri, Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::security;
use quadra_spi::{Result, SystemResolver};

/// True when the graph has a recorded model type and the caller may see it.
pub struct GraphExistsOperation {
    graph_uri: String,
    exists: ResultSlot<bool>,
}

impl GraphExistsOperation {
    pub fn new(graph_uri: &str) -> Result<Self> {
        require_graph_uri(graph_uri)?;
        Ok(Self {
            graph_uri: graph_uri.to_string(),
            exists: ResultSlot::new("GraphExistsOperation"),
        })
    }

    pub fn exists(&self) -> Result<bool> {
        self.exists.get().copied()
    }
}

impl Operation for GraphExistsOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let session = context.session();
        let exists = match session.lookup_persistent(&graph_node(&self.graph_uri))? {
            None => false,
            Some(graph) => {
                let graph = context.canonical_model(graph)?;
                context.graph_type(graph)?.is_some()
                    && security::check_visible(context.security_adapters(), graph, session.as_ref())
                        .is_ok()
            }
        };
        self.exists.set(exists)
    }

    fn is_write_operation(&self) -> bool {
        false
    }
}
