//! Requests executed inside a transaction.
//!
//! Each operation is built with its parameters, executed exactly once by
//! [`crate::transaction::Transaction::execute`], and then read for its
//! result. Reading before execution, or executing twice, is an
//! invalid-state error.

mod bootstrap;
mod create_graph;
mod export;
mod graph_exists;
mod login;
mod modify_graph;
mod preallocate;
mod query;
mod remove_graph;
mod rules;

pub use bootstrap::BootstrapOperation;
pub use create_graph::{CreateDefaultGraphOperation, CreateGraphOperation};
pub use export::ExportOperation;
pub use graph_exists::GraphExistsOperation;
pub use login::LoginOperation;
pub use modify_graph::{ModifyGraphOperation, StatementSource};
pub use preallocate::PreallocateOperation;
pub use query::QueryOperation;
pub use remove_graph::RemoveGraphOperation;
pub use rules::{ApplyRulesOperation, BuildRulesOperation};

use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use quadra_spi::{Error, GlobalNode, Result, SystemResolver};

pub trait Operation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        system_resolver: &dyn SystemResolver,
        metadata: &DatabaseMetadata,
    ) -> Result<()>;

    /// Whether the operation needs a write transaction. Must not depend on
    /// execution state.
    fn is_write_operation(&self) -> bool;
}

/// Write-once result holder.
#[derive(Debug)]
pub(crate) struct ResultSlot<T> {
    name: &'static str,
    value: Option<T>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self { name, value: None }
    }

    pub(crate) fn set(&mut self, value: T) -> Result<()> {
        if self.value.is_some() {
            return Err(Error::invalid_state(format!("{} executed twice", self.name)));
        }
        self.value = Some(value);
        Ok(())
    }

    pub(crate) fn get(&self) -> Result<&T> {
        self.value.as_ref().ok_or_else(|| {
            Error::invalid_state(format!("{} result requested before execution", self.name))
        })
    }

    pub(crate) fn take(&mut self) -> Result<T> {
        self.value.take().ok_or_else(|| {
            Error::invalid_state(format!("{} result requested before execution", self.name))
        })
    }

    pub(crate) fn is_set(&self) -> bool {
        self.value.is_some()
    }
}

/// Graph URIs must at least parse as absolute URIs.
pub(crate) fn require_graph_uri(uri: &str) -> Result<()> {
    url::Url::parse(uri)
        .map(|_| ())
        .map_err(|err| Error::InvalidArgument(format!("graph URI {uri:?} is invalid: {err}")))
}

pub(crate) fn graph_node(uri: &str) -> GlobalNode {
    GlobalNode::uri(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_slot_rejects_early_read_and_second_write() {
        let mut slot = ResultSlot::new("GraphExists");
        assert!(slot.get().unwrap_err().is_invalid_state());
        slot.set(7).unwrap();
        assert_eq!(*slot.get().unwrap(), 7);
        assert_eq!(*slot.get().unwrap(), 7);
        assert!(slot.set(8).unwrap_err().is_invalid_state());
        assert_eq!(slot.take().unwrap(), 7);
        assert!(!slot.is_set());
    }

    #[test]
    fn test_graph_uri_validation() {
        require_graph_uri("urn:g1").unwrap();
        require_graph_uri("quadra://localhost/server1#g").unwrap();
        assert!(matches!(
            require_graph_uri("not a uri"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
