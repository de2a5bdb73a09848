//! Localization sessions over the shared [`NodePool`].
//!
//! A session belongs to one transaction. Persistent allocations are staged
//! in the session and published to the pool on commit. Ephemeral ids are
//! negative, private to the session, and never published.

use crate::node_pool::NodePool;
use parking_lot::Mutex;
use quadra_spi::{
    EnlistableResource, EnlistableSession, Error, GlobalNode, NodeCategory, NodeId,
    ResolverSession, ResolverSessionFactory, ResourceId, Result,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct NodeMap {
    by_node: HashMap<GlobalNode, NodeId>,
    by_id: HashMap<NodeId, GlobalNode>,
}

impl NodeMap {
    fn insert(&mut self, id: NodeId, node: GlobalNode) {
        self.by_node.insert(node.clone(), id);
        self.by_id.insert(id, node);
    }

    fn clear(&mut self) {
        self.by_node.clear();
        self.by_id.clear();
    }
}

struct Ephemeral {
    nodes: NodeMap,
    next: i64,
}

pub struct StringPoolSession {
    id: ResourceId,
    pool: Arc<NodePool>,
    writable: bool,
    staged: Mutex<NodeMap>,
    ephemeral: Mutex<Ephemeral>,
}

impl StringPoolSession {
    pub fn new(pool: Arc<NodePool>, writable: bool) -> Self {
        Self {
            id: ResourceId::new(),
            pool,
            writable,
            staged: Mutex::new(NodeMap::default()),
            ephemeral: Mutex::new(Ephemeral {
                nodes: NodeMap::default(),
                next: -1,
            }),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of persistent allocations waiting for commit.
    pub fn staged_len(&self) -> usize {
        self.staged.lock().by_id.len()
    }

    fn allocate_ephemeral(&self, node: GlobalNode) -> NodeId {
        let mut eph = self.ephemeral.lock();
        if let Some(id) = eph.nodes.by_node.get(&node) {
            return *id;
        }
        let id = NodeId::new(eph.next);
        eph.next -= 1;
        eph.nodes.insert(id, node);
        id
    }

    fn allocate_persistent(&self, node: GlobalNode) -> NodeId {
        let id = self.pool.allocate_id();
        tracing::trace!(id = %id, node = %node, "staged persistent node");
        self.staged.lock().insert(id, node);
        id
    }

    /// Committed and staged persistent nodes visible to this session.
    fn persistent_entries(&self) -> Vec<(NodeId, GlobalNode)> {
        let mut entries = self.pool.entries();
        entries.extend(
            self.staged
                .lock()
                .by_id
                .iter()
                .map(|(id, node)| (*id, node.clone())),
        );
        entries
    }
}

impl ResolverSession for StringPoolSession {
    fn lookup(&self, node: &GlobalNode) -> Result<Option<NodeId>> {
        if let Some(id) = self.lookup_persistent(node)? {
            return Ok(Some(id));
        }
        Ok(self.ephemeral.lock().nodes.by_node.get(node).copied())
    }

    fn lookup_persistent(&self, node: &GlobalNode) -> Result<Option<NodeId>> {
        if let Some(id) = self.pool.lookup(node) {
            return Ok(Some(id));
        }
        Ok(self.staged.lock().by_node.get(node).copied())
    }

    fn localize(&self, node: &GlobalNode) -> Result<NodeId> {
        match self.lookup(node)? {
            Some(id) => Ok(id),
            None => Ok(self.allocate_ephemeral(node.clone())),
        }
    }

    fn localize_persistent(&self, node: &GlobalNode) -> Result<NodeId> {
        if let Some(id) = self.lookup_persistent(node)? {
            return Ok(id);
        }
        if !self.writable {
            return Err(Error::Localize(format!(
                "{node}: persistent allocation in a read-only session"
            )));
        }
        Ok(self.allocate_persistent(node.clone()))
    }

    fn globalize(&self, id: NodeId) -> Result<GlobalNode> {
        let found = if id.is_ephemeral() {
            self.ephemeral.lock().nodes.by_id.get(&id).cloned()
        } else if id.is_persistent() {
            self.pool
                .globalize(id)
                .or_else(|| self.staged.lock().by_id.get(&id).cloned())
        } else {
            None
        };
        found.ok_or(Error::Globalize(id.raw()))
    }

    fn new_blank_node(&self) -> Result<NodeId> {
        if self.writable {
            let id = self.pool.allocate_id();
            self.staged
                .lock()
                .insert(id, GlobalNode::Blank(format!("b{}", id.raw())));
            Ok(id)
        } else {
            let mut eph = self.ephemeral.lock();
            let id = NodeId::new(eph.next);
            eph.next -= 1;
            eph.nodes
                .insert(id, GlobalNode::Blank(format!("t{}", -id.raw())));
            Ok(id)
        }
    }

    fn find_string_pool_range(
        &self,
        low: Option<&GlobalNode>,
        include_low: bool,
        high: Option<&GlobalNode>,
        include_high: bool,
    ) -> Result<Vec<NodeId>> {
        let bound = low.or(high).ok_or_else(|| {
            Error::InvalidArgument("string pool range needs at least one bound".into())
        })?;
        if bound.category() != NodeCategory::Literal {
            return Err(Error::InvalidArgument(format!("{bound} is not a literal bound")));
        }
        if let (Some(l), Some(h)) = (low, high) {
            if l.compare_literal(h).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "range bounds {l} and {h} have different datatypes"
                )));
            }
        }

        let within = |node: &GlobalNode| {
            let above = match low.map(|l| node.compare_literal(l)) {
                None => true,
                Some(Some(Ordering::Greater)) => true,
                Some(Some(Ordering::Equal)) => include_low,
                _ => false,
            };
            let below = match high.map(|h| node.compare_literal(h)) {
                None => true,
                Some(Some(Ordering::Less)) => true,
                Some(Some(Ordering::Equal)) => include_high,
                _ => false,
            };
            above && below
        };

        let mut matches: Vec<(NodeId, GlobalNode)> = self
            .persistent_entries()
            .into_iter()
            .filter(|(_, node)| node.datatype() == bound.datatype() && within(node))
            .collect();
        matches.sort_by(|(_, a), (_, b)| a.compare_literal(b).unwrap_or(Ordering::Equal));
        Ok(matches.into_iter().map(|(id, _)| id).collect())
    }

    fn find_string_pool_type(
        &self,
        category: NodeCategory,
        datatype: Option<&str>,
    ) -> Result<Vec<NodeId>> {
        let mut ids: Vec<NodeId> = self
            .persistent_entries()
            .into_iter()
            .filter(|(_, node)| {
                node.category() == category && (datatype.is_none() || node.datatype() == datatype)
            })
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl EnlistableResource for StringPoolSession {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        let published = staged.by_id.len();
        self.pool.publish(staged.by_id);
        self.ephemeral.lock().nodes.clear();
        tracing::debug!(published, "string pool session committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let discarded = {
            let mut staged = self.staged.lock();
            let n = staged.by_id.len();
            staged.clear();
            n
        };
        self.ephemeral.lock().nodes.clear();
        tracing::debug!(discarded, "string pool session rolled back");
        Ok(())
    }

    fn abort(&self) {
        self.staged.lock().clear();
        self.ephemeral.lock().nodes.clear();
    }
}

/// Redirects every `localize`/`lookup` to its persistent counterpart. Used
/// for the system graph, which must never see an ephemeral id.
pub struct PersistentResolverSession {
    inner: Arc<dyn ResolverSession>,
}

impl PersistentResolverSession {
    pub fn new(inner: Arc<dyn ResolverSession>) -> Self {
        Self { inner }
    }
}

impl ResolverSession for PersistentResolverSession {
    fn lookup(&self, node: &GlobalNode) -> Result<Option<NodeId>> {
        self.inner.lookup_persistent(node)
    }

    fn lookup_persistent(&self, node: &GlobalNode) -> Result<Option<NodeId>> {
        self.inner.lookup_persistent(node)
    }

    fn localize(&self, node: &GlobalNode) -> Result<NodeId> {
        self.inner.localize_persistent(node)
    }

    fn localize_persistent(&self, node: &GlobalNode) -> Result<NodeId> {
        self.inner.localize_persistent(node)
    }

    fn globalize(&self, id: NodeId) -> Result<GlobalNode> {
        self.inner.globalize(id)
    }

    fn new_blank_node(&self) -> Result<NodeId> {
        self.inner.new_blank_node()
    }

    fn find_string_pool_range(
        &self,
        low: Option<&GlobalNode>,
        include_low: bool,
        high: Option<&GlobalNode>,
        include_high: bool,
    ) -> Result<Vec<NodeId>> {
        self.inner
            .find_string_pool_range(low, include_low, high, include_high)
    }

    fn find_string_pool_type(
        &self,
        category: NodeCategory,
        datatype: Option<&str>,
    ) -> Result<Vec<NodeId>> {
        self.inner.find_string_pool_type(category, datatype)
    }
}

pub struct StringPoolSessionFactory {
    pool: Arc<NodePool>,
}

impl StringPoolSessionFactory {
    pub fn new(pool: Arc<NodePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }
}

impl ResolverSessionFactory for StringPoolSessionFactory {
    fn new_session(&self, writable: bool) -> Result<Arc<dyn EnlistableSession>> {
        Ok(Arc::new(StringPoolSession::new(self.pool.clone(), writable)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XSD_INT: &str = "http://www.w3.org/2001/XMLSchema#int";

    fn session(writable: bool) -> (Arc<NodePool>, StringPoolSession) {
        let pool = Arc::new(NodePool::new());
        let session = StringPoolSession::new(pool.clone(), writable);
        (pool, session)
    }

    #[test]
    fn test_localize_allocates_ephemeral_ids() {
        let (pool, s) = session(false);
        let id = s.localize(&GlobalNode::uri("urn:tmp")).unwrap();
        assert!(id.is_ephemeral());
        assert_eq!(s.localize(&GlobalNode::uri("urn:tmp")).unwrap(), id);
        assert_eq!(s.globalize(id).unwrap(), GlobalNode::uri("urn:tmp"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_localize_prefers_persistent_id() {
        let (_, s) = session(true);
        let node = GlobalNode::uri("urn:a");
        let persistent = s.localize_persistent(&node).unwrap();
        assert_eq!(s.localize(&node).unwrap(), persistent);
    }

    #[test]
    fn test_persistent_allocation_published_on_commit() {
        let (pool, s) = session(true);
        let id = s.localize_persistent(&GlobalNode::uri("urn:a")).unwrap();
        assert!(id.is_persistent());
        assert_eq!(pool.lookup(&GlobalNode::uri("urn:a")), None);

        s.commit().unwrap();
        assert_eq!(pool.lookup(&GlobalNode::uri("urn:a")), Some(id));
    }

    #[test]
    fn test_rollback_discards_staged_and_ephemeral() {
        let (pool, s) = session(true);
        let staged = s.localize_persistent(&GlobalNode::uri("urn:a")).unwrap();
        let temp = s.localize(&GlobalNode::uri("urn:b")).unwrap();
        s.rollback().unwrap();

        assert!(pool.is_empty());
        assert!(matches!(s.globalize(staged), Err(Error::Globalize(_))));
        assert!(matches!(s.globalize(temp), Err(Error::Globalize(_))));
    }

    #[test]
    fn test_read_only_session_refuses_persistent_allocation() {
        let (_, s) = session(false);
        let err = s.localize_persistent(&GlobalNode::uri("urn:a")).unwrap_err();
        assert!(matches!(err, Error::Localize(_)));
    }

    #[test]
    fn test_globalize_unknown_id_fails() {
        let (_, s) = session(true);
        assert!(matches!(s.globalize(NodeId::new(99)), Err(Error::Globalize(99))));
        assert!(matches!(s.globalize(NodeId::NONE), Err(Error::Globalize(0))));
    }

    #[test]
    fn test_persistent_wrapper_never_hands_out_ephemeral_ids() {
        let (_, s) = session(true);
        let wrapper = PersistentResolverSession::new(Arc::new(s));
        let id = wrapper.localize(&GlobalNode::uri("urn:sys")).unwrap();
        assert!(id.is_persistent());
        assert_eq!(wrapper.lookup(&GlobalNode::uri("urn:sys")).unwrap(), Some(id));
    }

    #[test]
    fn test_string_pool_range_is_numeric_and_respects_inclusion() {
        let (_, s) = session(true);
        let ids: Vec<NodeId> = ["1", "5", "10", "20"]
            .iter()
            .map(|v| s.localize_persistent(&GlobalNode::typed_literal(*v, XSD_INT)).unwrap())
            .collect();
        s.localize_persistent(&GlobalNode::literal("7")).unwrap();

        let low = GlobalNode::typed_literal("5", XSD_INT);
        let high = GlobalNode::typed_literal("20", XSD_INT);
        let found = s
            .find_string_pool_range(Some(&low), true, Some(&high), false)
            .unwrap();
        assert_eq!(found, vec![ids[1], ids[2]]);

        let open_high = s.find_string_pool_range(Some(&low), false, None, false).unwrap();
        assert_eq!(open_high, vec![ids[2], ids[3]]);
    }

    #[test]
    fn test_string_pool_type_filters_category_and_datatype() {
        let (_, s) = session(true);
        let uri = s.localize_persistent(&GlobalNode::uri("urn:a")).unwrap();
        let int = s
            .localize_persistent(&GlobalNode::typed_literal("3", XSD_INT))
            .unwrap();
        let plain = s.localize_persistent(&GlobalNode::literal("x")).unwrap();

        assert_eq!(s.find_string_pool_type(NodeCategory::Uri, None).unwrap(), vec![uri]);
        assert_eq!(
            s.find_string_pool_type(NodeCategory::Literal, None).unwrap(),
            vec![int, plain]
        );
        assert_eq!(
            s.find_string_pool_type(NodeCategory::Literal, Some(XSD_INT)).unwrap(),
            vec![int]
        );
    }

    #[test]
    fn test_blank_nodes_follow_session_mode() {
        let (_, writable) = session(true);
        assert!(writable.new_blank_node().unwrap().is_persistent());
        let (_, read_only) = session(false);
        let blank = read_only.new_blank_node().unwrap();
        assert!(blank.is_ephemeral());
        assert!(matches!(read_only.globalize(blank).unwrap(), GlobalNode::Blank(_)));
    }
}
