//! Database assembly and the shared core every session runs against.
//!
//! ```text
//!   DatabaseBuilder ──build──► Database ──new_session──► DatabaseSession
//!        │                        │
//!        │                        └─ Arc<DatabaseCore>
//!        │                              ├─ string pool + session factory
//!        │                              ├─ system factory (also stores the default type)
//!        │                              ├─ internal factories by model type
//!        │                              ├─ scheme table for external factories
//!        │                              ├─ constraint registry + query evaluator
//!        │                              ├─ security adapter factories
//!        │                              └─ transaction manager + writer lock
//!        └─ bootstrap: system graph, then every factory's default graphs
//! ```

use crate::config::DatabaseConfig;
use crate::coordinator::SessionId;
use crate::internal::{DelegateMode, InternalResolverFactory};
use crate::metadata::DatabaseMetadata;
use crate::query::{LocalQueryEvaluator, QueryEvaluator, SymbolicTransformation};
use crate::registry::ConstraintRegistry;
use crate::rules::{RuleLoader, TransitiveRuleLoader};
use crate::scheme::SchemeRegistry;
use crate::security::{AclSecurityAdapterFactory, SecurityAdapterFactory, SystemGraphSecurityAdapterFactory};
use crate::session::DatabaseSession;
use crate::txmanager::{LocalTransactionManagerFactory, TransactionManager, TransactionManagerFactory};
use parking_lot::{Condvar, Mutex};
use quadra_spi::{
    Error, ResolverFactory, ResolverSessionFactory, Result, SecurityAdapter, SystemResolverFactory,
};
use quadra_store::{MemorySystemResolverFactory, NodePool, StringPoolSessionFactory};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Writer lock
// ============================================================================

/// Database-wide single-writer lock. Reentrant per session: a session that
/// already writes may open further write transactions.
#[derive(Default)]
pub struct WriteLock {
    owner: Mutex<Option<(SessionId, usize)>>,
    released: Condvar,
}

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other session holds the lock.
    pub fn acquire(&self, session: SessionId) {
        let mut owner = self.owner.lock();
        loop {
            match owner.as_mut() {
                None => {
                    *owner = Some((session, 1));
                    tracing::trace!(session = %session, "write lock acquired");
                    return;
                }
                Some((holder, count)) if *holder == session => {
                    *count += 1;
                    return;
                }
                Some((holder, _)) => {
                    tracing::debug!(session = %session, holder = %holder, "waiting for write lock");
                    self.released.wait(&mut owner);
                }
            }
        }
    }

    pub fn release(&self, session: SessionId) -> Result<()> {
        let mut owner = self.owner.lock();
        match owner.as_mut() {
            Some((holder, count)) if *holder == session => {
                *count -= 1;
                if *count == 0 {
                    *owner = None;
                    self.released.notify_all();
                    tracing::trace!(session = %session, "write lock released");
                }
                Ok(())
            }
            _ => Err(Error::invalid_state(format!(
                "session {session} released a write lock it does not hold"
            ))),
        }
    }

    pub fn holder(&self) -> Option<SessionId> {
        self.owner.lock().map(|(holder, _)| holder)
    }
}

// ============================================================================
// Core
// ============================================================================

pub struct DatabaseCore {
    config: DatabaseConfig,
    metadata: Arc<DatabaseMetadata>,
    session_factory: Arc<StringPoolSessionFactory>,
    system_factory: Arc<dyn SystemResolverFactory>,
    internal_factories: Vec<Arc<dyn ResolverFactory>>,
    internal_by_type: BTreeMap<String, Arc<dyn ResolverFactory>>,
    schemes: SchemeRegistry,
    cached_schemes: HashSet<String>,
    registry: ConstraintRegistry,
    evaluator: Arc<dyn QueryEvaluator>,
    security_factories: Vec<Arc<dyn SecurityAdapterFactory>>,
    transaction_manager_factory: Arc<dyn TransactionManagerFactory>,
    transaction_manager: Arc<dyn TransactionManager>,
    rule_loader: Arc<dyn RuleLoader>,
    write_lock: WriteLock,
    closed: AtomicBool,
}

impl DatabaseCore {
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<DatabaseMetadata> {
        &self.metadata
    }

    pub fn node_pool(&self) -> &Arc<NodePool> {
        self.session_factory.pool()
    }

    pub fn session_factory(&self) -> &dyn ResolverSessionFactory {
        self.session_factory.as_ref()
    }

    pub fn system_factory(&self) -> &Arc<dyn SystemResolverFactory> {
        &self.system_factory
    }

    /// The internal factory storing graphs of `model_type`.
    pub fn internal_factory(&self, model_type: &str) -> Option<Arc<dyn ResolverFactory>> {
        self.internal_by_type.get(model_type).cloned()
    }

    /// Each internal factory once, in registration order.
    pub fn internal_factories(&self) -> &[Arc<dyn ResolverFactory>] {
        &self.internal_factories
    }

    pub fn model_types(&self) -> impl Iterator<Item = &str> {
        self.internal_by_type.keys().map(String::as_str)
    }

    pub fn external_factory(&self, scheme: &str) -> Result<Option<Arc<dyn ResolverFactory>>> {
        self.schemes.factory(scheme, &self.config)
    }

    pub fn is_cached_scheme(&self, scheme: &str) -> bool {
        self.cached_schemes.contains(&scheme.to_ascii_lowercase())
    }

    pub fn registry(&self) -> &ConstraintRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &Arc<dyn QueryEvaluator> {
        &self.evaluator
    }

    pub fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.transaction_manager
    }

    pub fn write_lock(&self) -> &WriteLock {
        &self.write_lock
    }

    pub fn rule_loader(&self) -> &Arc<dyn RuleLoader> {
        &self.rule_loader
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// One adapter per registered factory, for a new session.
    pub fn new_security_adapters(&self) -> Result<Arc<[Arc<dyn SecurityAdapter>]>> {
        self.security_factories
            .iter()
            .map(|factory| factory.new_security_adapter(&self.metadata))
            .collect::<Result<Vec<_>>>()
            .map(Arc::from)
    }

    fn all_factories(&self) -> Vec<Arc<dyn ResolverFactory>> {
        let mut factories = self.internal_factories.clone();
        factories.extend(self.schemes.built_factories());
        factories
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct DatabaseBuilder {
    config: DatabaseConfig,
    resolver_factories: Vec<Arc<dyn ResolverFactory>>,
    schemes: SchemeRegistry,
    security_factories: Vec<Arc<dyn SecurityAdapterFactory>>,
    transformations: Vec<Arc<dyn SymbolicTransformation>>,
    registry: Option<ConstraintRegistry>,
    rule_loader: Arc<dyn RuleLoader>,
    transaction_manager_factory: Arc<dyn TransactionManagerFactory>,
}

impl DatabaseBuilder {
    fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            resolver_factories: Vec::new(),
            schemes: SchemeRegistry::new(),
            security_factories: Vec::new(),
            transformations: Vec::new(),
            registry: None,
            rule_loader: Arc::new(TransitiveRuleLoader),
            transaction_manager_factory: Arc::new(LocalTransactionManagerFactory::new()),
        }
    }

    /// Adds an internal factory; its model types must not overlap any other.
    pub fn with_resolver_factory(mut self, factory: Arc<dyn ResolverFactory>) -> Self {
        self.resolver_factories.push(factory);
        self
    }

    /// Registers an external factory constructor for graphs whose URI uses
    /// `scheme`.
    pub fn with_scheme(
        mut self,
        scheme: &str,
        constructor: impl Fn(&DatabaseConfig) -> Result<Arc<dyn ResolverFactory>> + Send + Sync + 'static,
    ) -> Self {
        self.schemes.register(scheme, constructor);
        self
    }

    /// Runs after the bundled system-graph and ACL adapters.
    pub fn with_security_adapter_factory(mut self, factory: Arc<dyn SecurityAdapterFactory>) -> Self {
        self.security_factories.push(factory);
        self
    }

    pub fn with_symbolic_transformation(mut self, transformation: Arc<dyn SymbolicTransformation>) -> Self {
        self.transformations.push(transformation);
        self
    }

    /// Replaces the default constraint registry.
    pub fn with_constraint_registry(mut self, registry: ConstraintRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_rule_loader(mut self, loader: Arc<dyn RuleLoader>) -> Self {
        self.rule_loader = loader;
        self
    }

    pub fn with_transaction_manager_factory(mut self, factory: Arc<dyn TransactionManagerFactory>) -> Self {
        self.transaction_manager_factory = factory;
        self
    }

    pub fn build(self) -> Result<Database> {
        self.config
            .validate()
            .map_err(|err| Error::InvalidConfiguration(format!("{err:#}")))?;
        let metadata = Arc::new(DatabaseMetadata::new(&self.config));

        let system: Arc<MemorySystemResolverFactory> = Arc::new(MemorySystemResolverFactory::new(vec![
            self.config.system_graph_type.clone(),
            self.config.default_graph_type.clone(),
        ]));
        let mut internal_factories: Vec<Arc<dyn ResolverFactory>> = vec![Arc::new(
            InternalResolverFactory::new(system.clone(), DelegateMode::ReuseSystemResolver, metadata.clone()),
        )];
        for factory in self.resolver_factories {
            internal_factories.push(Arc::new(InternalResolverFactory::new(
                factory,
                DelegateMode::ConstructNew,
                metadata.clone(),
            )));
        }

        let mut internal_by_type = BTreeMap::new();
        for factory in &internal_factories {
            for model_type in factory.model_types() {
                if model_type == self.config.temporary_graph_type {
                    return Err(Error::InvalidConfiguration(format!(
                        "model type {model_type} is reserved for cached graphs"
                    )));
                }
                if internal_by_type.insert(model_type.clone(), factory.clone()).is_some() {
                    return Err(Error::InvalidConfiguration(format!(
                        "model type {model_type} is stored by more than one factory"
                    )));
                }
            }
        }

        let registry = self.registry.unwrap_or_else(ConstraintRegistry::with_defaults);
        registry.verify()?;

        let mut security_factories: Vec<Arc<dyn SecurityAdapterFactory>> = vec![
            Arc::new(SystemGraphSecurityAdapterFactory),
            Arc::new(AclSecurityAdapterFactory::new(self.config.security.clone())),
        ];
        security_factories.extend(self.security_factories);

        let transaction_manager = self.transaction_manager_factory.new_transaction_manager()?;
        let cached_schemes = self
            .config
            .cached_schemes
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();

        let core = Arc::new(DatabaseCore {
            metadata,
            session_factory: Arc::new(StringPoolSessionFactory::new(Arc::new(NodePool::new()))),
            system_factory: system,
            internal_factories,
            internal_by_type,
            schemes: self.schemes,
            cached_schemes,
            registry,
            evaluator: Arc::new(LocalQueryEvaluator::new(self.transformations)),
            security_factories,
            transaction_manager_factory: self.transaction_manager_factory,
            transaction_manager,
            rule_loader: self.rule_loader,
            write_lock: WriteLock::new(),
            closed: AtomicBool::new(false),
            config: self.config,
        });

        let database = Database { core };
        database.bootstrap()?;
        Ok(database)
    }
}

// ============================================================================
// Database
// ============================================================================

/// An embedded database. Cheap to clone; clones share the same core.
#[derive(Clone)]
pub struct Database {
    core: Arc<DatabaseCore>,
}

impl Database {
    pub fn builder(config: DatabaseConfig) -> DatabaseBuilder {
        DatabaseBuilder::new(config)
    }

    /// A database with only the bundled factories.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    fn bootstrap(&self) -> Result<()> {
        let session = self.new_session()?;
        let nodes = session.bootstrap()?;
        tracing::debug!(
            system_graph = %nodes.system_graph,
            rdf_type = %nodes.rdf_type,
            "bootstrapped system graph"
        );
        for factory in self.core.internal_factories() {
            for default in factory.default_graphs() {
                let created = session.create_default_graph(&default.graph_uri, &default.model_type)?;
                tracing::info!(
                    graph = %default.graph_uri,
                    model_type = %default.model_type,
                    created,
                    "provisioned default graph"
                );
            }
        }
        session.close()
    }

    pub fn new_session(&self) -> Result<DatabaseSession> {
        if self.core.is_closed() {
            return Err(Error::invalid_state("database is closed"));
        }
        DatabaseSession::new(self.core.clone())
    }

    pub fn core(&self) -> &Arc<DatabaseCore> {
        &self.core
    }

    pub fn metadata(&self) -> &DatabaseMetadata {
        self.core.metadata()
    }

    pub fn config(&self) -> &DatabaseConfig {
        self.core.config()
    }

    /// Closes every factory. Sessions still open fail on their next
    /// transaction.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        for factory in self.core.all_factories() {
            if let Err(err) = factory.close() {
                tracing::warn!(error = %err, "failed to close resolver factory");
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.core.transaction_manager_factory.close() {
            first_error.get_or_insert(err);
        }
        tracing::info!(database = %self.core.metadata().database_uri(), "database closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Closes the database and discards everything it stored.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        for factory in self.core.all_factories() {
            factory.delete()?;
        }
        tracing::info!(database = %self.core.metadata().database_uri(), "database deleted");
        Ok(())
    }
}
