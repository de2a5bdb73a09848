//! Security adapters bundled with the database, and the checks operations
//! run against the adapter chain.
//!
//! Every session gets its own adapter instances from the registered
//! [`SecurityAdapterFactory`]s. Adapters are consulted in order; the first
//! `false` denies.

use crate::config::SecurityConfig;
use crate::metadata::DatabaseMetadata;
use parking_lot::Mutex;
use quadra_spi::{Error, GlobalNode, NodeId, ResolverSession, Result, SecurityAdapter};
use std::collections::HashSet;
use std::sync::Arc;

pub trait SecurityAdapterFactory: Send + Sync {
    fn new_security_adapter(&self, metadata: &DatabaseMetadata) -> Result<Arc<dyn SecurityAdapter>>;
}

// ============================================================================
// Chain checks
// ============================================================================

/// Label used in error messages: the graph URI when it has one.
pub fn graph_label(graph: NodeId, session: &dyn ResolverSession) -> String {
    match session.globalize(graph) {
        Ok(GlobalNode::Uri(uri)) => uri,
        Ok(other) => other.to_string(),
        Err(_) => graph.to_string(),
    }
}

/// Invisible graphs are reported exactly like missing ones.
pub fn check_visible(
    adapters: &[Arc<dyn SecurityAdapter>],
    graph: NodeId,
    session: &dyn ResolverSession,
) -> Result<()> {
    for adapter in adapters {
        if !adapter.can_see_model(graph, session)? {
            return Err(Error::NoSuchGraph(graph_label(graph, session)));
        }
    }
    Ok(())
}

pub fn check_modifiable(
    adapters: &[Arc<dyn SecurityAdapter>],
    graph: NodeId,
    session: &dyn ResolverSession,
) -> Result<()> {
    check_visible(adapters, graph, session)?;
    for adapter in adapters {
        if !adapter.can_modify_model(graph, session)? {
            return Err(Error::PermissionDenied(format!(
                "You aren't allowed to modify {}",
                graph_label(graph, session)
            )));
        }
    }
    Ok(())
}

pub fn check_removable(
    adapters: &[Arc<dyn SecurityAdapter>],
    graph: NodeId,
    session: &dyn ResolverSession,
) -> Result<()> {
    check_visible(adapters, graph, session)?;
    for adapter in adapters {
        if !adapter.can_remove_model(graph, session)? {
            return Err(Error::PermissionDenied(format!(
                "You aren't allowed to remove {}",
                graph_label(graph, session)
            )));
        }
    }
    Ok(())
}

fn creation_denied(graph: NodeId, session: &dyn ResolverSession) -> Error {
    Error::PermissionDenied(format!(
        "You aren't allowed to create {}",
        graph_label(graph, session)
    ))
}

/// Run before looking a graph up for creation. An invisible graph is refused
/// exactly like one the caller may not create, whether or not it exists.
pub fn check_visible_for_create(
    adapters: &[Arc<dyn SecurityAdapter>],
    graph: NodeId,
    session: &dyn ResolverSession,
) -> Result<()> {
    match check_visible(adapters, graph, session) {
        Err(Error::NoSuchGraph(_)) => Err(creation_denied(graph, session)),
        other => other,
    }
}

pub fn check_creatable(
    adapters: &[Arc<dyn SecurityAdapter>],
    graph: NodeId,
    session: &dyn ResolverSession,
) -> Result<()> {
    for adapter in adapters {
        if !adapter.can_create_model(graph, session)? {
            return Err(creation_denied(graph, session));
        }
    }
    Ok(())
}

pub fn can_resolve(
    adapters: &[Arc<dyn SecurityAdapter>],
    graph: NodeId,
    session: &dyn ResolverSession,
) -> Result<bool> {
    for adapter in adapters {
        if !adapter.can_resolve(graph, session)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// Bundled adapters
// ============================================================================

/// Keeps the system graph out of reach of ordinary modification.
pub struct SystemGraphSecurityAdapter {
    system_graph_uri: String,
}

impl SystemGraphSecurityAdapter {
    pub fn new(system_graph_uri: impl Into<String>) -> Self {
        Self {
            system_graph_uri: system_graph_uri.into(),
        }
    }

    fn is_system_graph(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        match session.globalize(graph) {
            Ok(node) => Ok(node.as_uri() == Some(self.system_graph_uri.as_str())),
            Err(Error::Globalize(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl SecurityAdapter for SystemGraphSecurityAdapter {
    fn can_modify_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.is_system_graph(graph, session)?)
    }

    fn can_remove_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.is_system_graph(graph, session)?)
    }

    fn can_create_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.is_system_graph(graph, session)?)
    }
}

pub struct SystemGraphSecurityAdapterFactory;

impl SecurityAdapterFactory for SystemGraphSecurityAdapterFactory {
    fn new_security_adapter(&self, metadata: &DatabaseMetadata) -> Result<Arc<dyn SecurityAdapter>> {
        Ok(Arc::new(SystemGraphSecurityAdapter::new(metadata.system_graph_uri())))
    }
}

/// Graph deny-lists and credential checks from [`SecurityConfig`].
pub struct AclSecurityAdapter {
    hidden: HashSet<String>,
    read_only: HashSet<String>,
    protected: HashSet<String>,
    config: SecurityConfig,
    user: Mutex<Option<String>>,
}

impl AclSecurityAdapter {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            hidden: config.hidden_graphs.iter().cloned().collect(),
            read_only: config.read_only_graphs.iter().cloned().collect(),
            protected: config.protected_graphs.iter().cloned().collect(),
            config,
            user: Mutex::new(None),
        }
    }

    pub fn user(&self) -> Option<String> {
        self.user.lock().clone()
    }

    fn graph_in(
        &self,
        set: &HashSet<String>,
        graph: NodeId,
        session: &dyn ResolverSession,
    ) -> Result<bool> {
        if set.is_empty() {
            return Ok(false);
        }
        match session.globalize(graph) {
            Ok(GlobalNode::Uri(uri)) => Ok(set.contains(&uri)),
            Ok(_) | Err(Error::Globalize(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl SecurityAdapter for AclSecurityAdapter {
    fn can_see_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.graph_in(&self.hidden, graph, session)?)
    }

    fn can_modify_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.graph_in(&self.read_only, graph, session)?)
    }

    fn can_remove_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.graph_in(&self.read_only, graph, session)?
            && !self.graph_in(&self.protected, graph, session)?)
    }

    fn can_create_model(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        Ok(!self.graph_in(&self.hidden, graph, session)?)
    }

    fn can_resolve(&self, graph: NodeId, session: &dyn ResolverSession) -> Result<bool> {
        self.can_see_model(graph, session)
    }

    fn login(&self, security_domain: &str, user: &str, password: &str) -> Result<()> {
        if !self.config.users.is_empty() && self.config.users.get(user).map(String::as_str) != Some(password) {
            tracing::warn!(domain = security_domain, user, "rejected login");
            return Err(Error::PermissionDenied(format!("invalid credentials for {user}")));
        }
        tracing::debug!(domain = security_domain, user, "login accepted");
        *self.user.lock() = Some(user.to_string());
        Ok(())
    }
}

pub struct AclSecurityAdapterFactory {
    config: SecurityConfig,
}

impl AclSecurityAdapterFactory {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }
}

impl SecurityAdapterFactory for AclSecurityAdapterFactory {
    fn new_security_adapter(&self, _metadata: &DatabaseMetadata) -> Result<Arc<dyn SecurityAdapter>> {
        Ok(Arc::new(AclSecurityAdapter::new(self.config.clone())))
    }
}
