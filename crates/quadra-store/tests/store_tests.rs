use quadra_spi::{
    Constraint, ConstraintElement, EnlistableResource, GlobalNode, NodeId, Resolver, ResolverFactory,
    ResolverSession, Statement, SystemResolverFactory,
};
use quadra_store::{MemoryResolverFactory, MemorySystemResolverFactory, NodePool, StringPoolSession};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_concurrent_sessions_allocate_distinct_ids() {
    let pool = Arc::new(NodePool::new());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                let session = StringPoolSession::new(pool, true);
                let ids: Vec<NodeId> = (0..50)
                    .map(|n| {
                        session
                            .localize_persistent(&GlobalNode::uri(format!("urn:t{t}:{n}")))
                            .unwrap()
                    })
                    .collect();
                session.prepare().unwrap();
                session.commit().unwrap();
                ids
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(id.is_persistent());
            assert!(seen.insert(id), "id {id} allocated twice");
        }
    }
    assert_eq!(pool.len(), 400);
}

#[test]
fn test_resolver_writes_visible_after_commit_only() {
    let pool = Arc::new(NodePool::new());
    let session: Arc<dyn ResolverSession> = Arc::new(StringPoolSession::new(pool, true));
    let system_factory = MemorySystemResolverFactory::new(vec!["urn:system".to_string()]);
    let system = system_factory.new_system_resolver(true, session.clone()).unwrap();
    let factory = MemoryResolverFactory::new("urn:t");

    let graph = session.localize_persistent(&GlobalNode::uri("urn:g")).unwrap();
    let [a, p, b, c] = ["urn:a", "urn:p", "urn:b", "urn:c"]
        .map(|uri| session.localize_persistent(&GlobalNode::uri(uri)).unwrap());
    let everything = Constraint::new(
        ConstraintElement::var("s"),
        ConstraintElement::var("p"),
        ConstraintElement::var("o"),
        graph,
    );

    let writer = factory.new_resolver(true, session.clone(), system.clone()).unwrap();
    writer.create_model(graph, "urn:t").unwrap();
    writer.modify_model(graph, &[Statement::new(a, p, b)], true).unwrap();
    assert_eq!(writer.resolve(&everything).unwrap().tuples.row_count(), 1);

    let other = factory.new_resolver(false, session.clone(), system.clone()).unwrap();
    assert_eq!(other.resolve(&everything).unwrap().tuples.row_count(), 0);

    writer.prepare().unwrap();
    writer.commit().unwrap();
    let reader = factory.new_resolver(false, session.clone(), system.clone()).unwrap();
    assert_eq!(reader.resolve(&everything).unwrap().tuples.row_count(), 1);

    let discarded = factory.new_resolver(true, session.clone(), system.clone()).unwrap();
    discarded.modify_model(graph, &[Statement::new(a, p, c)], true).unwrap();
    discarded.rollback().unwrap();
    let reader = factory.new_resolver(false, session, system).unwrap();
    assert_eq!(reader.resolve(&everything).unwrap().tuples.row_count(), 1);
}
