//! Capability checks consulted before the core touches a graph.
//!
//! Adapters are consulted in registration order and the first `false` denies
//! the operation. Every predicate defaults to allowing.

use crate::error::Result;
use crate::node::NodeId;
use crate::resolver::ResolverSession;

pub trait SecurityAdapter: Send + Sync {
    fn can_see_model(&self, _graph: NodeId, _session: &dyn ResolverSession) -> Result<bool> {
        Ok(true)
    }

    fn can_modify_model(&self, _graph: NodeId, _session: &dyn ResolverSession) -> Result<bool> {
        Ok(true)
    }

    fn can_remove_model(&self, _graph: NodeId, _session: &dyn ResolverSession) -> Result<bool> {
        Ok(true)
    }

    fn can_create_model(&self, _graph: NodeId, _session: &dyn ResolverSession) -> Result<bool> {
        Ok(true)
    }

    /// A `false` here yields an empty result rather than an error.
    fn can_resolve(&self, _graph: NodeId, _session: &dyn ResolverSession) -> Result<bool> {
        Ok(true)
    }

    /// Registers credentials for the calling session.
    fn login(&self, _security_domain: &str, _user: &str, _password: &str) -> Result<()> {
        Ok(())
    }
}
