//! Quadra resolver service-provider interface
//!
//! Everything a storage backend needs to plug into the transactional core:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      quadra-resolver                         │
//! │   Transaction ─► OperationContext ─► ConstraintRegistry      │
//! └──────────────┬───────────────────────────────┬───────────────┘
//!                │ ResolverFactory / Resolver    │ ResolverSession
//!                ▼                               ▼
//!        ┌───────────────┐               ┌───────────────┐
//!        │  graph stores │               │  string pool  │
//!        └───────────────┘               └───────────────┘
//! ```
//!
//! - [`node`]: local node ids and their global (URI / literal / blank) forms
//! - [`constraint`]: constraint and graph expression trees
//! - [`tuples`]: materialized variable bindings and the relational operators over them
//! - [`resolver`]: the resolver, factory, session and enlistment traits
//! - [`security`]: capability predicates consulted before touching a graph

pub mod constraint;
pub mod error;
pub mod node;
pub mod resolver;
pub mod security;
pub mod tuples;

pub use constraint::{
    Constraint, ConstraintElement, ConstraintExpression, ConstraintShape, GraphExpression,
    GraphShape, Variable,
};
pub use error::{Error, Result};
pub use node::{GlobalNode, NodeCategory, NodeId, Statement, RDF_TYPE};
pub use resolver::{
    DefaultGraph, EnlistableResource, EnlistableSession, Resolution, Resolver, ResolverFactory,
    ResolverSession, ResolverSessionFactory, ResourceId, SystemResolver, SystemResolverFactory,
};
pub use security::SecurityAdapter;
pub use tuples::Tuples;
