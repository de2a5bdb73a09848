//! URI scheme → external resolver factory table.
//!
//! Constructors are registered up front; each factory is built the first
//! time a graph with its scheme is resolved, then reused.

use crate::config::DatabaseConfig;
use parking_lot::Mutex;
use quadra_spi::{Result, ResolverFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type FactoryConstructor =
    Box<dyn Fn(&DatabaseConfig) -> Result<Arc<dyn ResolverFactory>> + Send + Sync>;

#[derive(Default)]
pub struct SchemeRegistry {
    constructors: BTreeMap<String, FactoryConstructor>,
    built: Mutex<HashMap<String, Arc<dyn ResolverFactory>>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `scheme`, replacing any earlier one.
    pub fn register(
        &mut self,
        scheme: impl Into<String>,
        constructor: impl Fn(&DatabaseConfig) -> Result<Arc<dyn ResolverFactory>> + Send + Sync + 'static,
    ) {
        self.constructors
            .insert(scheme.into().to_ascii_lowercase(), Box::new(constructor));
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.constructors.contains_key(&scheme.to_ascii_lowercase())
    }

    /// The factory for `scheme`, constructing it on first use.
    pub fn factory(
        &self,
        scheme: &str,
        config: &DatabaseConfig,
    ) -> Result<Option<Arc<dyn ResolverFactory>>> {
        let scheme = scheme.to_ascii_lowercase();
        let Some(constructor) = self.constructors.get(&scheme) else {
            return Ok(None);
        };
        let mut built = self.built.lock();
        if let Some(factory) = built.get(&scheme) {
            return Ok(Some(factory.clone()));
        }
        let factory = constructor(config)?;
        tracing::info!(scheme = %scheme, "constructed external resolver factory");
        built.insert(scheme, factory.clone());
        Ok(Some(factory))
    }

    /// Factories constructed so far.
    pub fn built_factories(&self) -> Vec<Arc<dyn ResolverFactory>> {
        self.built.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadra_store::MemoryResolverFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_constructs_once_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = SchemeRegistry::new();
        registry.register("mem", move |_: &DatabaseConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemoryResolverFactory::external()) as Arc<dyn ResolverFactory>)
        });
        let config = DatabaseConfig::default();

        let first = registry.factory("mem", &config).unwrap().unwrap();
        let second = registry.factory("MEM", &config).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.built_factories().len(), 1);
    }

    #[test]
    fn test_unknown_scheme_is_none() {
        let registry = SchemeRegistry::new();
        assert!(registry
            .factory("ftp", &DatabaseConfig::default())
            .unwrap()
            .is_none());
        assert!(!registry.contains("ftp"));
    }
}
