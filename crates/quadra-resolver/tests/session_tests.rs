//! Session-level behavior of an assembled database: graph lifecycle,
//! explicit transactions, security, cached external graphs, rules and
//! export.

use quadra_resolver::rules::TRANSITIVE_PROPERTY;
use quadra_resolver::{Answer, Database, DatabaseConfig, DatabaseSession, Query, SecurityConfig};
use quadra_spi::{
    Constraint, ConstraintElement, ConstraintExpression, Error, GlobalNode, GraphExpression,
    Resolver, ResolverFactory, ResolverSession, Result, SystemResolver, Variable, RDF_TYPE,
};
use quadra_store::MemoryResolverFactory;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn typed_database(config: DatabaseConfig) -> Database {
    Database::builder(config)
        .with_resolver_factory(Arc::new(MemoryResolverFactory::new("urn:t1")))
        .with_resolver_factory(Arc::new(MemoryResolverFactory::new("urn:t2")))
        .build()
        .unwrap()
}

fn triple(s: &str, p: &str, o: &str) -> [GlobalNode; 3] {
    [GlobalNode::uri(s), GlobalNode::uri(p), GlobalNode::uri(o)]
}

fn ask(graph: &str, s: &str, p: &str, o: &str) -> Query {
    Query::ask(
        GraphExpression::resource(graph),
        ConstraintExpression::Pattern(Constraint::pattern(
            ConstraintElement::uri(s),
            ConstraintElement::uri(p),
            ConstraintElement::uri(o),
        )),
    )
}

fn select_types(session: &DatabaseSession, system_graph: &str, graph: &str) -> Vec<String> {
    let query = Query::select(
        vec![Variable::new("t")],
        GraphExpression::resource(system_graph),
        ConstraintExpression::Pattern(Constraint::pattern(
            ConstraintElement::uri(graph),
            ConstraintElement::uri(RDF_TYPE),
            ConstraintElement::var("t"),
        )),
    )
    .unwrap();
    let mut answer = session.query(query).unwrap().into_rows().unwrap();
    let rows = answer.rows().unwrap();
    answer.close().unwrap();
    rows.into_iter()
        .filter_map(|row| row[0].as_ref().and_then(|n| n.as_uri().map(str::to_string)))
        .collect()
}

// ============================================================================
// Graph lifecycle
// ============================================================================

#[test]
fn test_create_default_graph_is_idempotent() {
    let config = DatabaseConfig::default();
    let system_graph = config.system_graph_uri();
    let database = typed_database(config);
    let session = database.new_session().unwrap();

    assert!(session.create_default_graph("urn:g1", "urn:t1").unwrap());
    assert!(!session.create_default_graph("urn:g1", "urn:t1").unwrap());
    let err = session.create_default_graph("urn:g1", "urn:t2").unwrap_err();
    assert!(matches!(err, Error::TypeConflict { ref existing, .. } if existing == "urn:t1"));
    assert_eq!(
        select_types(&session, &system_graph, "urn:g1"),
        vec!["urn:t1".to_string()]
    );
}

#[test]
fn test_create_with_unknown_type_is_rejected() {
    let database = typed_database(DatabaseConfig::default());
    let session = database.new_session().unwrap();
    let err = session.create_graph("urn:g", Some("urn:nobody")).unwrap_err();
    assert!(matches!(err, Error::UnsupportedModelType(_)));
    assert!(!session.graph_exists("urn:g").unwrap());
}

#[test]
fn test_remove_graph_round_trip() {
    let database = typed_database(DatabaseConfig::default());
    let session = database.new_session().unwrap();

    assert!(matches!(
        session.remove_graph("urn:missing"),
        Err(Error::NoSuchGraph(_))
    ));

    assert!(session.create_graph("urn:g", Some("urn:t2")).unwrap());
    session.insert("urn:g", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();
    assert!(session.graph_exists("urn:g").unwrap());

    session.remove_graph("urn:g").unwrap();
    assert!(!session.graph_exists("urn:g").unwrap());
    assert!(matches!(session.remove_graph("urn:g"), Err(Error::NoSuchGraph(_))));

    // The type was forgotten, so the graph can come back with another one.
    assert!(session.create_graph("urn:g", Some("urn:t1")).unwrap());
}

#[test]
fn test_delete_ignores_unknown_nodes() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    session.create_graph("urn:g", None).unwrap();
    session.insert("urn:g", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();

    let count = session
        .delete("urn:g", vec![triple("urn:never", "urn:p", "urn:b"), triple("urn:a", "urn:p", "urn:b")])
        .unwrap();
    assert_eq!(count, 1);
    assert!(!session.query(ask("urn:g", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
}

// ============================================================================
// Security
// ============================================================================

#[test]
fn test_hidden_and_read_only_graphs() {
    let config = DatabaseConfig {
        security: SecurityConfig {
            hidden_graphs: vec!["urn:hidden".into()],
            read_only_graphs: vec!["urn:frozen".into()],
            ..SecurityConfig::default()
        },
        ..DatabaseConfig::default()
    };
    let database = Database::open(config).unwrap();
    let session = database.new_session().unwrap();

    assert!(matches!(
        session.create_graph("urn:hidden", None),
        Err(Error::PermissionDenied(_))
    ));
    assert!(!session.graph_exists("urn:hidden").unwrap());

    session.create_graph("urn:frozen", None).unwrap();
    let err = session
        .insert("urn:frozen", vec![triple("urn:a", "urn:p", "urn:b")])
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(matches!(session.remove_graph("urn:frozen"), Err(Error::PermissionDenied(_))));
}

#[test]
fn test_create_does_not_reveal_hidden_graphs() {
    let config = DatabaseConfig {
        security: SecurityConfig {
            hidden_graphs: vec!["urn:hidden".into(), "urn:hidden2".into()],
            ..SecurityConfig::default()
        },
        ..DatabaseConfig::default()
    };
    let database = typed_database(config);
    let session = database.new_session().unwrap();
    // Default-graph provisioning bypasses the creation check.
    assert!(session.create_default_graph("urn:hidden", "urn:t1").unwrap());
    assert!(!session.graph_exists("urn:hidden").unwrap());

    let refusal = |graph: &str, model_type: Option<&str>| match session.create_graph(graph, model_type) {
        Err(Error::PermissionDenied(message)) => message.replace(graph, "<graph>"),
        other => panic!("expected permission denied for {graph}, got {other:?}"),
    };
    let same_type = refusal("urn:hidden", Some("urn:t1"));
    let other_type = refusal("urn:hidden", Some("urn:t2"));
    let absent = refusal("urn:hidden2", Some("urn:t1"));
    assert_eq!(same_type, absent);
    assert_eq!(other_type, absent);
    assert!(!absent.contains("urn:t1"));
}

#[test]
fn test_system_graph_cannot_be_removed() {
    let config = DatabaseConfig::default();
    let system_graph = config.system_graph_uri();
    let database = Database::open(config).unwrap();
    let session = database.new_session().unwrap();
    assert!(session.graph_exists(&system_graph).unwrap());
    assert!(matches!(session.remove_graph(&system_graph), Err(Error::PermissionDenied(_))));
}

#[test]
fn test_login_checks_configured_users() {
    let config = DatabaseConfig {
        security: SecurityConfig {
            users: [("ada".to_string(), "secret".to_string())].into(),
            ..SecurityConfig::default()
        },
        ..DatabaseConfig::default()
    };
    let database = Database::open(config).unwrap();
    let session = database.new_session().unwrap();
    assert!(matches!(
        session.login("urn:domain", "ada", "wrong"),
        Err(Error::PermissionDenied(_))
    ));
    session.login("urn:domain", "ada", "secret").unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn test_explicit_commit_and_rollback() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let writer = database.new_session().unwrap();
    let reader = database.new_session().unwrap();
    writer.create_graph("urn:g", None).unwrap();

    writer.set_auto_commit(false).unwrap();
    writer.insert("urn:g", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();
    assert!(writer.query(ask("urn:g", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
    assert!(!reader.query(ask("urn:g", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
    writer.commit().unwrap();
    assert!(reader.query(ask("urn:g", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());

    writer.insert("urn:g", vec![triple("urn:b", "urn:p", "urn:c")]).unwrap();
    writer.rollback().unwrap();
    writer.set_auto_commit(true).unwrap();
    assert!(!reader.query(ask("urn:g", "urn:b", "urn:p", "urn:c")).unwrap().as_boolean().unwrap());
}

#[test]
fn test_commit_in_auto_commit_mode_is_invalid() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    assert!(session.commit().unwrap_err().is_invalid_state());
    assert!(session.rollback().unwrap_err().is_invalid_state());
}

#[test]
fn test_failed_explicit_transaction_needs_rollback() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    session.set_auto_commit(false).unwrap();
    assert!(session.remove_graph("urn:missing").is_err());

    let err = session.set_auto_commit(true).unwrap_err();
    assert!(err.is_transactional());
    session.rollback().unwrap();
    session.create_graph("urn:g", None).unwrap();
    session.commit().unwrap();
    session.set_auto_commit(true).unwrap();
    assert!(session.graph_exists("urn:g").unwrap());
}

#[test]
fn test_idle_explicit_transaction_is_reaped() {
    let config = DatabaseConfig {
        idle_timeout_ms: 0,
        ..DatabaseConfig::default()
    };
    let database = Database::open(config).unwrap();
    let session = database.new_session().unwrap();
    session.create_graph("urn:g", None).unwrap();
    session.set_auto_commit(false).unwrap();
    session.insert("urn:g", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(session.reap_idle_transactions().unwrap(), 1);
    assert!(session.commit().is_err());
    session.rollback().unwrap();
    session.set_auto_commit(true).unwrap();
    assert!(!session.query(ask("urn:g", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
}

#[test]
fn test_open_answer_keeps_transaction_alive() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    session.create_graph("urn:g", None).unwrap();
    session
        .insert(
            "urn:g",
            vec![triple("urn:a", "urn:p", "urn:b"), triple("urn:a", "urn:p", "urn:c")],
        )
        .unwrap();

    let query = Query::select(
        vec![Variable::new("o")],
        GraphExpression::resource("urn:g"),
        ConstraintExpression::Pattern(Constraint::pattern(
            ConstraintElement::uri("urn:a"),
            ConstraintElement::uri("urn:p"),
            ConstraintElement::var("o"),
        )),
    )
    .unwrap();
    let mut answer = session.query(query).unwrap().into_rows().unwrap();
    assert_eq!(session.coordinator().live_transactions(), 1);
    assert_eq!(answer.row_count().unwrap(), 2);
    answer.close().unwrap();
    assert_eq!(session.coordinator().live_transactions(), 0);
    assert!(answer.next().is_err());
}

// ============================================================================
// External graphs, rules, export
// ============================================================================

#[test]
fn test_cached_external_graph_writes_back_on_commit() {
    let external = Arc::new(MemoryResolverFactory::external());
    let handle = external.clone();
    let config = DatabaseConfig {
        cached_schemes: vec!["mem".into()],
        ..DatabaseConfig::default()
    };
    let database = Database::builder(config)
        .with_scheme("mem", move |_| Ok(handle.clone() as Arc<dyn ResolverFactory>))
        .build()
        .unwrap();
    let session = database.new_session().unwrap();

    session.set_auto_commit(false).unwrap();
    session.insert("mem:scratch", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();
    session.rollback().unwrap();
    assert_eq!(external.store().graph_count(), 0);

    session.insert("mem:data", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();
    assert_eq!(external.store().graph_count(), 0);
    session.commit().unwrap();
    session.set_auto_commit(true).unwrap();
    assert_eq!(external.store().graph_count(), 1);

    let reader = database.new_session().unwrap();
    assert!(reader.query(ask("mem:data", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
}

/// External factory that counts the resolvers it hands out.
struct CountingFactory {
    inner: MemoryResolverFactory,
    resolvers: AtomicUsize,
}

impl ResolverFactory for CountingFactory {
    fn new_resolver(
        &self,
        can_write: bool,
        session: Arc<dyn ResolverSession>,
        system_resolver: Arc<dyn SystemResolver>,
    ) -> Result<Arc<dyn Resolver>> {
        self.resolvers.fetch_add(1, Ordering::SeqCst);
        self.inner.new_resolver(can_write, session, system_resolver)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }
}

#[test]
fn test_cached_graph_uses_one_external_resolver_per_transaction() {
    let external = Arc::new(CountingFactory {
        inner: MemoryResolverFactory::external(),
        resolvers: AtomicUsize::new(0),
    });
    let handle = external.clone();
    let config = DatabaseConfig {
        cached_schemes: vec!["mem".into()],
        ..DatabaseConfig::default()
    };
    let database = Database::builder(config)
        .with_scheme("mem", move |_| Ok(handle.clone() as Arc<dyn ResolverFactory>))
        .build()
        .unwrap();
    let session = database.new_session().unwrap();

    session.set_auto_commit(false).unwrap();
    session.insert("mem:data", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();
    session.insert("mem:other", vec![triple("urn:b", "urn:p", "urn:c")]).unwrap();
    assert!(session.query(ask("mem:data", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
    session.commit().unwrap();
    session.set_auto_commit(true).unwrap();

    assert_eq!(external.resolvers.load(Ordering::SeqCst), 1);
    assert_eq!(external.inner.store().graph_count(), 2);
}

#[test]
fn test_unregistered_scheme_is_no_such_graph() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    let err = session
        .insert("http://example.org/g", vec![triple("urn:a", "urn:p", "urn:b")])
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchGraph(_)));
}

#[test]
fn test_transitive_rules_fill_destination() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    for graph in ["urn:rules", "urn:family", "urn:inferred"] {
        session.create_graph(graph, None).unwrap();
    }
    session
        .insert("urn:rules", vec![triple("urn:ancestor", RDF_TYPE, TRANSITIVE_PROPERTY)])
        .unwrap();
    session
        .insert(
            "urn:family",
            vec![
                triple("urn:a", "urn:ancestor", "urn:b"),
                triple("urn:b", "urn:ancestor", "urn:c"),
            ],
        )
        .unwrap();

    let rules = session.build_rules("urn:rules", "urn:family", "urn:inferred").unwrap();
    assert_eq!(rules.destination_graph(), "urn:inferred");
    assert_eq!(session.apply_rules(rules).unwrap(), 1);
    assert!(session
        .query(ask("urn:inferred", "urn:a", "urn:ancestor", "urn:c"))
        .unwrap()
        .as_boolean()
        .unwrap());
}

#[test]
fn test_export_writes_ntriples() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    session.create_graph("urn:g", None).unwrap();
    session
        .insert(
            "urn:g",
            vec![[
                GlobalNode::uri("urn:a"),
                GlobalNode::uri("urn:label"),
                GlobalNode::literal("hello"),
            ]],
        )
        .unwrap();

    let out = String::from_utf8(session.export("urn:g", Vec::new()).unwrap()).unwrap();
    assert_eq!(out.trim_end(), r#"<urn:a> <urn:label> "hello" ."#);
    assert!(matches!(
        session.export("urn:missing", Vec::new()),
        Err(Error::NoSuchGraph(_))
    ));
}

#[test]
fn test_insert_from_query() {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    session.create_graph("urn:src", None).unwrap();
    session.create_graph("urn:dst", None).unwrap();
    session.insert("urn:src", vec![triple("urn:a", "urn:p", "urn:b")]).unwrap();

    let query = Query::select(
        vec![Variable::new("s"), Variable::new("p"), Variable::new("o")],
        GraphExpression::resource("urn:src"),
        ConstraintExpression::Pattern(Constraint::pattern(
            ConstraintElement::var("s"),
            ConstraintElement::var("p"),
            ConstraintElement::var("o"),
        )),
    )
    .unwrap();
    assert_eq!(session.modify_from_query("urn:dst", query, true).unwrap(), 1);
    assert!(session.query(ask("urn:dst", "urn:a", "urn:p", "urn:b")).unwrap().as_boolean().unwrap());
}

fn select_uris(session: &DatabaseSession, query: Query) -> Vec<Vec<Option<String>>> {
    let mut answer = session.query(query).unwrap().into_rows().unwrap();
    let rows = answer.rows().unwrap();
    answer.close().unwrap();
    let mut rows: Vec<Vec<Option<String>>> = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|node| node.and_then(|n| n.as_uri().map(str::to_string)))
                .collect()
        })
        .collect();
    rows.sort();
    rows
}

fn people_database() -> (Database, DatabaseSession) {
    let database = Database::open(DatabaseConfig::default()).unwrap();
    let session = database.new_session().unwrap();
    session.create_graph("urn:a", None).unwrap();
    session.create_graph("urn:b", None).unwrap();
    session
        .insert(
            "urn:a",
            vec![triple("urn:x", "urn:knows", "urn:o"), triple("urn:x", "urn:mbox", "urn:m")],
        )
        .unwrap();
    session.insert("urn:b", vec![triple("urn:y", "urn:knows", "urn:o")]).unwrap();
    (database, session)
}

fn knows_o() -> ConstraintExpression {
    ConstraintExpression::Pattern(Constraint::pattern(
        ConstraintElement::var("s"),
        ConstraintElement::uri("urn:knows"),
        ConstraintElement::uri("urn:o"),
    ))
}

#[test]
fn test_graph_variable_ranges_over_visible_graphs() {
    let (_database, session) = people_database();
    let query = Query::select(
        vec![Variable::new("g"), Variable::new("s")],
        GraphExpression::variable("g"),
        knows_o(),
    )
    .unwrap();
    let some = |uri: &str| Some(uri.to_string());
    assert_eq!(
        select_uris(&session, query),
        vec![vec![some("urn:a"), some("urn:x")], vec![some("urn:b"), some("urn:y")]]
    );
}

#[test]
fn test_optional_join_keeps_rows_without_a_match() {
    let (_database, session) = people_database();
    let query = Query::select(
        vec![Variable::new("s"), Variable::new("m")],
        GraphExpression::union(GraphExpression::resource("urn:a"), GraphExpression::resource("urn:b")),
        ConstraintExpression::optional_join(
            knows_o(),
            ConstraintExpression::Pattern(Constraint::pattern(
                ConstraintElement::var("s"),
                ConstraintElement::uri("urn:mbox"),
                ConstraintElement::var("m"),
            )),
        ),
    )
    .unwrap();
    assert_eq!(
        select_uris(&session, query),
        vec![
            vec![Some("urn:x".to_string()), Some("urn:m".to_string())],
            vec![Some("urn:y".to_string()), None],
        ]
    );
}
