use super::{graph_node, require_graph_uri, Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::security;
use quadra_spi::{Error, Result, SystemResolver};

/// Removes a graph. A missing graph and one the caller may not see fail
/// identically.
pub struct RemoveGraphOperation {
    graph_uri: String,
    done: ResultSlot<()>,
}

impl RemoveGraphOperation {
    pub fn new(graph_uri: &str) -> Result<Self> {
        require_graph_uri(graph_uri)?;
        Ok(Self {
            graph_uri: graph_uri.to_string(),
            done: ResultSlot::new("RemoveGraphOperation"),
        })
    }

    pub fn result(&self) -> Result<()> {
        self.done.get().copied()
    }
}

impl Operation for RemoveGraphOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let session = context.session();
        let graph = session
            .lookup_persistent(&graph_node(&self.graph_uri))?
            .ok_or_else(|| Error::NoSuchGraph(self.graph_uri.clone()))?;
        let graph = context.canonical_model(graph)?;
        security::check_visible(context.security_adapters(), graph, session.as_ref())?;

        let factory = match context.find_model_resolver_factory(graph) {
            Ok(factory) => factory,
            Err(Error::UnsupportedModelType(_)) => {
                return Err(Error::NoSuchGraph(self.graph_uri.clone()))
            }
            Err(err) => return Err(err),
        };
        security::check_removable(context.security_adapters(), graph, session.as_ref())?;

        let resolver = context.obtain_resolver(&factory)?;
        resolver.remove_model(graph)?;
        context.forget_graph_type(graph);
        tracing::info!(graph = %self.graph_uri, "removed graph");
        self.done.set(())
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}
