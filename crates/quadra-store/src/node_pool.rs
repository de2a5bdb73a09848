//! Committed node dictionary shared by every session.

use dashmap::DashMap;
use quadra_spi::{GlobalNode, NodeId};
use std::sync::atomic::{AtomicI64, Ordering};

pub struct NodePool {
    /// Node to id mapping
    by_node: DashMap<GlobalNode, NodeId>,
    /// Id to node mapping (for globalization)
    by_id: DashMap<NodeId, GlobalNode>,
    /// Next persistent id; ids start at 1 so that 0 stays `NONE`
    next_id: AtomicI64,
}

impl NodePool {
    pub fn new() -> Self {
        Self {
            by_node: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Reserves a fresh persistent id. Ids of rolled-back allocations are
    /// never reused.
    pub fn allocate_id(&self) -> NodeId {
        NodeId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn lookup(&self, node: &GlobalNode) -> Option<NodeId> {
        self.by_node.get(node).map(|id| *id)
    }

    pub fn globalize(&self, id: NodeId) -> Option<GlobalNode> {
        self.by_id.get(&id).map(|node| node.clone())
    }

    /// Makes staged allocations visible to every session.
    pub fn publish(&self, entries: impl IntoIterator<Item = (NodeId, GlobalNode)>) {
        for (id, node) in entries {
            self.by_node.insert(node.clone(), id);
            self.by_id.insert(id, node);
        }
    }

    pub fn entries(&self) -> Vec<(NodeId, GlobalNode)> {
        self.by_id
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_publish_then_lookup_both_ways() {
        let pool = NodePool::new();
        let id = pool.allocate_id();
        assert!(id.is_persistent());
        assert_eq!(pool.lookup(&GlobalNode::uri("urn:a")), None);

        pool.publish([(id, GlobalNode::uri("urn:a"))]);
        assert_eq!(pool.lookup(&GlobalNode::uri("urn:a")), Some(id));
        assert_eq!(pool.globalize(id), Some(GlobalNode::uri("urn:a")));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_allocated_ids_are_distinct() {
        let pool = NodePool::new();
        let a = pool.allocate_id();
        let b = pool.allocate_id();
        assert_ne!(a, b);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn published_entries_globalize_back(names in proptest::collection::hash_set("[a-z]{1,8}", 0..32)) {
            let pool = NodePool::new();
            let entries: Vec<(NodeId, GlobalNode)> = names
                .iter()
                .map(|name| (pool.allocate_id(), GlobalNode::uri(format!("urn:{name}"))))
                .collect();
            pool.publish(entries.clone());
            prop_assert_eq!(pool.len(), names.len());
            for (id, node) in entries {
                prop_assert_eq!(pool.lookup(&node), Some(id));
                prop_assert_eq!(pool.globalize(id), Some(node));
            }
        }
    }
}
