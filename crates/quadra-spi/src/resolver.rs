//! Traits implemented by storage backends.
//!
//! A [`ResolverFactory`] is a long-lived descriptor registered with the
//! database. Each transaction asks it for a [`Resolver`], which is enlisted in
//! that transaction for two-phase completion. Node ids are mapped to and from
//! their global form through a [`ResolverSession`].

use crate::constraint::Constraint;
use crate::error::Result;
use crate::node::{GlobalNode, NodeCategory, NodeId, Statement};
use crate::tuples::Tuples;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Localization
// ============================================================================

/// Maps global nodes to local ids and back.
pub trait ResolverSession: Send + Sync {
    /// Existing id for `node`, persistent or ephemeral. Never allocates.
    fn lookup(&self, node: &GlobalNode) -> Result<Option<NodeId>>;

    /// Existing persistent id for `node`. Never allocates.
    fn lookup_persistent(&self, node: &GlobalNode) -> Result<Option<NodeId>>;

    /// Id for `node`, allocating an ephemeral one if it has none.
    fn localize(&self, node: &GlobalNode) -> Result<NodeId>;

    /// Persistent id for `node`, allocating one if necessary.
    fn localize_persistent(&self, node: &GlobalNode) -> Result<NodeId>;

    /// Inverse of localization. Fails with [`crate::Error::Globalize`] for
    /// ids this session never produced.
    fn globalize(&self, id: NodeId) -> Result<GlobalNode>;

    fn new_blank_node(&self) -> Result<NodeId>;

    /// Literal ids between two bounds of the same datatype. A missing bound
    /// is open.
    fn find_string_pool_range(
        &self,
        low: Option<&GlobalNode>,
        include_low: bool,
        high: Option<&GlobalNode>,
        include_high: bool,
    ) -> Result<Vec<NodeId>>;

    /// Ids of a category, optionally restricted to one literal datatype.
    fn find_string_pool_type(
        &self,
        category: NodeCategory,
        datatype: Option<&str>,
    ) -> Result<Vec<NodeId>>;
}

// ============================================================================
// Enlistment
// ============================================================================

/// Identity of a transactional participant. Two handles with the same id are
/// the same participant and are enlisted once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participant in two-phase completion.
pub trait EnlistableResource: Send + Sync {
    fn resource_id(&self) -> ResourceId;

    fn prepare(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Last-resort cleanup after a failed abort. Must not fail.
    fn abort(&self);
}

/// A localization session that takes part in the transaction.
pub trait EnlistableSession: ResolverSession + EnlistableResource {}

impl<T: ResolverSession + EnlistableResource> EnlistableSession for T {}

/// Hands out one localization session per transaction.
pub trait ResolverSessionFactory: Send + Sync {
    fn new_session(&self, writable: bool) -> Result<Arc<dyn EnlistableSession>>;
}

// ============================================================================
// Resolvers
// ============================================================================

/// Outcome of resolving one constraint.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub constraint: Constraint,
    pub tuples: Tuples,
    /// True when no other resolver could contribute further rows.
    pub complete: bool,
}

impl Resolution {
    pub fn new(constraint: Constraint, tuples: Tuples, complete: bool) -> Self {
        Self {
            constraint,
            tuples,
            complete,
        }
    }
}

/// A backend handle bound to one transaction.
pub trait Resolver: EnlistableResource {
    fn create_model(&self, graph: NodeId, model_type: &str) -> Result<()>;

    /// Inserts (`occurs == true`) or deletes statements.
    fn modify_model(&self, graph: NodeId, statements: &[Statement], occurs: bool) -> Result<()>;

    fn remove_model(&self, graph: NodeId) -> Result<()>;

    /// The graph position must be a local node or a variable.
    fn resolve(&self, constraint: &Constraint) -> Result<Resolution>;
}

/// The resolver owning the system graph, where graph types are recorded.
pub trait SystemResolver: Resolver {
    /// Creates the system graph itself and records its own type in it.
    fn create_system_model(&self, graph: NodeId, model_type: NodeId) -> Result<()>;
}

/// A graph a factory provisions when the database bootstraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultGraph {
    pub graph_uri: String,
    pub model_type: String,
}

pub trait ResolverFactory: Send + Sync {
    fn new_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
        system_resolver: Arc<dyn SystemResolver>,
    ) -> Result<Arc<dyn Resolver>>;

    /// Model type URIs whose graphs this factory stores.
    fn model_types(&self) -> Vec<String> {
        Vec::new()
    }

    fn default_graphs(&self) -> Vec<DefaultGraph> {
        Vec::new()
    }

    fn supports_export(&self) -> bool {
        true
    }

    fn close(&self) -> Result<()>;

    /// Closes and discards all persistent state.
    fn delete(&self) -> Result<()>;
}

pub trait SystemResolverFactory: ResolverFactory {
    fn new_system_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
    ) -> Result<Arc<dyn SystemResolver>>;
}
