//! Quadra in-process storage collaborators
//!
//! The transactional core only talks to these through the `quadra-spi`
//! traits. They keep everything in memory:
//!
//! - [`NodePool`]: the shared, committed mapping between global nodes and
//!   persistent ids
//! - [`StringPoolSession`]: per-transaction localization with staged
//!   persistent allocations and a private ephemeral range
//! - [`MemoryResolverFactory`] / [`MemorySystemResolverFactory`]: graph
//!   stores whose writes become visible on commit

pub mod memory;
pub mod node_pool;
pub mod string_pool;

pub use memory::{
    GraphData, MemoryResolver, MemoryResolverFactory, MemoryStore, MemorySystemResolver,
    MemorySystemResolverFactory, StagingMode,
};
pub use node_pool::NodePool;
pub use string_pool::{PersistentResolverSession, StringPoolSession, StringPoolSessionFactory};
