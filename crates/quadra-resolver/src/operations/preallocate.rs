use super::{Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use quadra_spi::{GlobalNode, NodeId, Result, SystemResolver};

/// Gives a node a persistent id without storing any statement about it.
pub struct PreallocateOperation {
    node: GlobalNode,
    id: ResultSlot<NodeId>,
}

impl PreallocateOperation {
    pub fn new(node: GlobalNode) -> Self {
        Self {
            node,
            id: ResultSlot::new("PreallocateOperation"),
        }
    }

    pub fn node_id(&self) -> Result<NodeId> {
        self.id.get().copied()
    }
}

impl Operation for PreallocateOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let id = context.session().localize_persistent(&self.node)?;
        tracing::trace!(node = %self.node, id = %id, "preallocated node");
        self.id.set(id)
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}
