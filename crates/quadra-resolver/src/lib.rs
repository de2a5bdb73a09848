//! Quadra transactional resolver core
//!
//! Operations run inside transactions; each transaction owns an operation
//! context that finds the resolver factory for a graph, obtains and enlists
//! resolvers, applies the security adapter chain, and evaluates constraint
//! expressions through the constraint registry.
//!
//! ```text
//! DatabaseSession ─► TransactionCoordinator ─► Transaction ─► Operation
//!                                                  │
//!                                                  ▼
//!                                      DatabaseOperationContext
//!                                  ┌──────────┼───────────────┐
//!                                  ▼          ▼               ▼
//!                       InternalResolverFactory  CacheResolverFactory  ConstraintRegistry
//! ```
//!
//! - [`transaction`]: activation, reference counting, commit and rollback
//! - [`coordinator`]: auto-commit and explicit transactions per session
//! - [`context`]: the per-transaction operation context
//! - [`operations`]: graph creation, removal, modification, queries, export, rules
//! - [`answer`]: lazily evaluated, transaction-bound query answers
//! - [`database`]: assembly, bootstrap and the single-writer lock

pub mod answer;
pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod database;
pub mod internal;
pub mod metadata;
pub mod ntriples;
pub mod operations;
pub mod query;
pub mod registry;
pub mod rules;
pub mod scheme;
pub mod security;
pub mod session;
pub mod transaction;
pub mod txmanager;

pub use answer::{
    with_answer, Answer, AnswerOperation, AnswerOperationResult, AnswerValue, QueryAnswer,
    TransactionalAnswer, TuplesAnswer,
};
pub use config::{DatabaseConfig, SecurityConfig};
pub use context::{DatabaseOperationContext, OperationContext};
pub use coordinator::{SessionId, TransactionCoordinator};
pub use database::{Database, DatabaseBuilder, DatabaseCore};
pub use metadata::{DatabaseMetadata, SystemNodes};
pub use operations::Operation;
pub use query::{Query, QueryKind, SymbolicTransformation};
pub use registry::ConstraintRegistry;
pub use rules::{RuleLoader, Rules};
pub use security::SecurityAdapterFactory;
pub use session::DatabaseSession;
pub use transaction::{Transaction, TransactionId, TransactionState};
