use super::{graph_node, Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::{DatabaseMetadata, SystemNodes};
use quadra_spi::{Constraint, GlobalNode, Result, SystemResolver, RDF_TYPE};

/// Creates the system graph on first start and records the ids of the
/// well-known nodes in the metadata.
#[derive(Debug)]
pub struct BootstrapOperation {
    nodes: ResultSlot<SystemNodes>,
}

impl BootstrapOperation {
    pub fn new() -> Self {
        Self {
            nodes: ResultSlot::new("BootstrapOperation"),
        }
    }

    pub fn system_nodes(&self) -> Result<SystemNodes> {
        self.nodes.get().copied()
    }
}

impl Default for BootstrapOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for BootstrapOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        system_resolver: &dyn SystemResolver,
        metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let session = context.session();
        let nodes = SystemNodes {
            rdf_type: session.localize_persistent(&GlobalNode::uri(RDF_TYPE))?,
            system_graph: session.localize_persistent(&graph_node(metadata.system_graph_uri()))?,
            system_graph_type: session
                .localize_persistent(&GlobalNode::uri(metadata.system_graph_type()))?,
        };

        let existing = system_resolver.resolve(&Constraint::new(
            nodes.system_graph,
            nodes.rdf_type,
            nodes.system_graph_type,
            nodes.system_graph,
        ))?;
        if existing.tuples.is_empty() {
            system_resolver.create_system_model(nodes.system_graph, nodes.system_graph_type)?;
            tracing::info!(graph = %metadata.system_graph_uri(), "created system graph");
        }
        metadata.initialize_system_nodes(nodes)?;
        self.nodes.set(nodes)
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}
