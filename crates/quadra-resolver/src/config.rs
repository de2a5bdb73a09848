//! Database configuration, loaded from JSON.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Base URI of the database; the system graph is `<database_uri>#`
    pub database_uri: String,
    /// Host names that refer to this database in graph URIs
    pub hostname_aliases: Vec<String>,
    /// Model type of the system graph
    pub system_graph_type: String,
    /// Model type used when a graph is created without one
    pub default_graph_type: String,
    /// Model type of the scratch graphs that hold cached external content
    pub temporary_graph_type: String,
    /// URI schemes whose graphs are read through the per-transaction cache
    pub cached_schemes: Vec<String>,
    /// Transactions idle longer than this are rolled back by the reaper
    pub idle_timeout_ms: u64,
    pub security: SecurityConfig,
    pub log_level: String,
}

/// Graph-level access rules applied to every session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Graphs reported as nonexistent
    pub hidden_graphs: Vec<String>,
    /// Visible graphs that cannot be modified
    pub read_only_graphs: Vec<String>,
    /// Visible graphs that cannot be removed
    pub protected_graphs: Vec<String>,
    /// Known users and their passwords; empty disables credential checks
    pub users: BTreeMap<String, String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_uri: "quadra://localhost/server1".to_string(),
            hostname_aliases: vec!["127.0.0.1".to_string()],
            system_graph_type: "http://quadra.dev/graph-type#System".to_string(),
            default_graph_type: "http://quadra.dev/graph-type#Model".to_string(),
            temporary_graph_type: "http://quadra.dev/graph-type#Temporary".to_string(),
            cached_schemes: Vec::new(),
            idle_timeout_ms: 15 * 60 * 1000,
            security: SecurityConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        let config: DatabaseConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.database_uri)
            .with_context(|| format!("database_uri {} is not a URI", self.database_uri))?;
        if self.database_uri.contains('#') {
            anyhow::bail!("database_uri {} must not have a fragment", self.database_uri);
        }
        for ty in [
            &self.system_graph_type,
            &self.default_graph_type,
            &self.temporary_graph_type,
        ] {
            url::Url::parse(ty).with_context(|| format!("model type {ty} is not a URI"))?;
        }
        if self.temporary_graph_type == self.default_graph_type
            || self.temporary_graph_type == self.system_graph_type
        {
            anyhow::bail!("temporary_graph_type must differ from the stored graph types");
        }
        Ok(())
    }

    pub fn system_graph_uri(&self) -> String {
        format!("{}#", self.database_uri)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = DatabaseConfig::default();
        config.validate().unwrap();
        assert_eq!(config.system_graph_uri(), "quadra://localhost/server1#");
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config = DatabaseConfig::from_json(r#"{"cached_schemes": ["mem"]}"#).unwrap();
        assert_eq!(config.cached_schemes, vec!["mem".to_string()]);
        assert_eq!(config.database_uri, DatabaseConfig::default().database_uri);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quadra.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"database_uri": "quadra://db.example/main", "security": {{"hidden_graphs": ["urn:secret"]}}}}"#
        )
        .unwrap();

        let config = DatabaseConfig::load(&path).unwrap();
        assert_eq!(config.system_graph_uri(), "quadra://db.example/main#");
        assert_eq!(config.security.hidden_graphs, vec!["urn:secret".to_string()]);
    }

    #[test]
    fn test_rejects_fragment_in_database_uri() {
        let err = DatabaseConfig::from_json(r#"{"database_uri": "quadra://h/s#x"}"#).unwrap_err();
        assert!(err.to_string().contains("fragment"));
    }

    #[test]
    fn test_round_trips_through_json() {
        let json = DatabaseConfig::default().to_json_pretty().unwrap();
        let back = DatabaseConfig::from_json(&json).unwrap();
        assert_eq!(back.default_graph_type, DatabaseConfig::default().default_graph_type);
    }
}
