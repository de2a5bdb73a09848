//! Well-known URIs and the node ids bootstrap assigns to them.

use crate::config::DatabaseConfig;
use quadra_spi::{Error, NodeId, Result, RDF_TYPE};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemNodes {
    pub system_graph: NodeId,
    pub rdf_type: NodeId,
    pub system_graph_type: NodeId,
}

#[derive(Debug)]
pub struct DatabaseMetadata {
    database_uri: String,
    system_graph_uri: String,
    system_graph_type: String,
    default_graph_type: String,
    temporary_graph_type: String,
    hostname_aliases: Vec<String>,
    nodes: OnceLock<SystemNodes>,
}

impl DatabaseMetadata {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            database_uri: config.database_uri.clone(),
            system_graph_uri: config.system_graph_uri(),
            system_graph_type: config.system_graph_type.clone(),
            default_graph_type: config.default_graph_type.clone(),
            temporary_graph_type: config.temporary_graph_type.clone(),
            hostname_aliases: config.hostname_aliases.clone(),
            nodes: OnceLock::new(),
        }
    }

    /// Records the ids bootstrap preallocated. A second call with the same
    /// ids is accepted; different ids are a programming error.
    pub fn initialize_system_nodes(&self, nodes: SystemNodes) -> Result<()> {
        let stored = self.nodes.get_or_init(|| nodes);
        if *stored != nodes {
            return Err(Error::invalid_state(format!(
                "system nodes already initialized as {stored:?}"
            )));
        }
        Ok(())
    }

    pub fn system_nodes(&self) -> Result<SystemNodes> {
        self.nodes
            .get()
            .copied()
            .ok_or_else(|| Error::invalid_state("database has not been bootstrapped"))
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.nodes.get().is_some()
    }

    pub fn system_graph_node(&self) -> Result<NodeId> {
        Ok(self.system_nodes()?.system_graph)
    }

    pub fn rdf_type_node(&self) -> Result<NodeId> {
        Ok(self.system_nodes()?.rdf_type)
    }

    pub fn system_graph_type_node(&self) -> Result<NodeId> {
        Ok(self.system_nodes()?.system_graph_type)
    }

    pub fn database_uri(&self) -> &str {
        &self.database_uri
    }

    pub fn system_graph_uri(&self) -> &str {
        &self.system_graph_uri
    }

    pub fn system_graph_type(&self) -> &str {
        &self.system_graph_type
    }

    pub fn default_graph_type(&self) -> &str {
        &self.default_graph_type
    }

    pub fn temporary_graph_type(&self) -> &str {
        &self.temporary_graph_type
    }

    pub fn hostname_aliases(&self) -> &[String] {
        &self.hostname_aliases
    }

    pub fn rdf_type_uri(&self) -> &'static str {
        RDF_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(offset: i64) -> SystemNodes {
        SystemNodes {
            system_graph: NodeId::new(1 + offset),
            rdf_type: NodeId::new(2 + offset),
            system_graph_type: NodeId::new(3 + offset),
        }
    }

    #[test]
    fn test_accessors_fail_before_bootstrap() {
        let metadata = DatabaseMetadata::new(&DatabaseConfig::default());
        assert!(metadata.system_graph_node().unwrap_err().is_invalid_state());
        assert!(!metadata.is_bootstrapped());
    }

    #[test]
    fn test_initialize_is_idempotent_for_same_nodes() {
        let metadata = DatabaseMetadata::new(&DatabaseConfig::default());
        metadata.initialize_system_nodes(nodes(0)).unwrap();
        metadata.initialize_system_nodes(nodes(0)).unwrap();
        assert_eq!(metadata.rdf_type_node().unwrap(), NodeId::new(2));
        assert!(metadata.initialize_system_nodes(nodes(10)).is_err());
    }
}
