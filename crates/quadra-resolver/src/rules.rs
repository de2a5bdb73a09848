//! Rule loading and execution.
//!
//! A [`RuleLoader`] reads a rule graph into a [`Rules`] value; applying the
//! rules writes inferred statements into a destination graph. The bundled
//! [`TransitiveRuleLoader`] understands one rule form: every predicate typed
//! `quadra:TransitiveProperty` in the rule graph is closed transitively over
//! the base graph.

use crate::context::OperationContext;
use crate::security;
use quadra_spi::{
    Constraint, ConstraintElement, Error, GlobalNode, NodeId, Result, Statement, SystemResolver,
    Variable, RDF_TYPE,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

pub const TRANSITIVE_PROPERTY: &str = "http://quadra.dev/rules#TransitiveProperty";

pub trait RuleLoader: Send + Sync {
    fn read_rules(
        &self,
        context: &dyn OperationContext,
        rule_graph: &str,
        base_graph: &str,
        destination_graph: &str,
    ) -> Result<Arc<dyn Rules>>;
}

pub trait Rules: Send + Sync + fmt::Debug {
    /// Runs the rules and returns how many new statements were inferred.
    fn run(&self, context: &dyn OperationContext, system_resolver: &dyn SystemResolver) -> Result<u64>;

    fn destination_graph(&self) -> &str;
}

#[derive(Debug, Default)]
pub struct TransitiveRuleLoader;

impl RuleLoader for TransitiveRuleLoader {
    fn read_rules(
        &self,
        context: &dyn OperationContext,
        rule_graph: &str,
        base_graph: &str,
        destination_graph: &str,
    ) -> Result<Arc<dyn Rules>> {
        let session = context.session();
        let graph = session
            .lookup_persistent(&GlobalNode::uri(rule_graph))?
            .ok_or_else(|| Error::NoSuchGraph(rule_graph.to_string()))?;
        let (Some(rdf_type), Some(transitive)) = (
            session.lookup(&GlobalNode::uri(RDF_TYPE))?,
            session.lookup(&GlobalNode::uri(TRANSITIVE_PROPERTY))?,
        ) else {
            return Ok(Arc::new(TransitiveRules::new(Vec::new(), base_graph, destination_graph)));
        };
        let tuples = context.resolve(&Constraint::new(
            ConstraintElement::var("p"),
            rdf_type,
            transitive,
            graph,
        ))?;
        let column = tuples.column_index(&Variable::new("p"));
        let predicates = tuples
            .rows()
            .iter()
            .filter_map(|row| column.map(|c| row[c]))
            .map(|id| session.globalize(id))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(rule_graph, rules = predicates.len(), "read transitive rules");
        Ok(Arc::new(TransitiveRules::new(predicates, base_graph, destination_graph)))
    }
}

#[derive(Debug, Clone)]
pub struct TransitiveRules {
    predicates: Vec<GlobalNode>,
    base_graph: String,
    destination_graph: String,
}

impl TransitiveRules {
    pub fn new(predicates: Vec<GlobalNode>, base_graph: &str, destination_graph: &str) -> Self {
        Self {
            predicates,
            base_graph: base_graph.to_string(),
            destination_graph: destination_graph.to_string(),
        }
    }

    pub fn predicates(&self) -> &[GlobalNode] {
        &self.predicates
    }
}

/// Pairs reachable through `edges` that are not already edges.
fn closure(edges: &BTreeSet<(NodeId, NodeId)>) -> BTreeSet<(NodeId, NodeId)> {
    let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for (from, to) in edges {
        adjacency.entry(*from).or_default().push(*to);
    }
    let mut inferred = BTreeSet::new();
    for start in adjacency.keys() {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = adjacency[start].iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            if !edges.contains(&(*start, node)) {
                inferred.insert((*start, node));
            }
            if let Some(next) = adjacency.get(&node) {
                queue.extend(next.iter().copied());
            }
        }
    }
    inferred
}

impl Rules for TransitiveRules {
    fn run(&self, context: &dyn OperationContext, _system_resolver: &dyn SystemResolver) -> Result<u64> {
        let session = context.session();
        let base = session
            .lookup_persistent(&GlobalNode::uri(self.base_graph.as_str()))?
            .ok_or_else(|| Error::NoSuchGraph(self.base_graph.clone()))?;
        let destination = session
            .lookup_persistent(&GlobalNode::uri(self.destination_graph.as_str()))?
            .ok_or_else(|| Error::NoSuchGraph(self.destination_graph.clone()))?;
        let destination = context.canonical_model(destination)?;
        security::check_modifiable(context.security_adapters(), destination, session.as_ref())?;

        let mut statements = Vec::new();
        for predicate in &self.predicates {
            let Some(p) = session.lookup(predicate)? else {
                continue;
            };
            let tuples = context.resolve(&Constraint::new(
                ConstraintElement::var("s"),
                p,
                ConstraintElement::var("o"),
                base,
            ))?;
            let (Some(s), Some(o)) = (
                tuples.column_index(&Variable::new("s")),
                tuples.column_index(&Variable::new("o")),
            ) else {
                continue;
            };
            let edges: BTreeSet<(NodeId, NodeId)> =
                tuples.rows().iter().map(|row| (row[s], row[o])).collect();
            for (from, to) in closure(&edges) {
                statements.push(Statement::new(from, p, to));
            }
        }
        if statements.is_empty() {
            return Ok(0);
        }
        // Ephemeral ids cannot be stored.
        for statement in &mut statements {
            for id in [&mut statement.subject, &mut statement.predicate, &mut statement.object] {
                if id.is_ephemeral() {
                    *id = session.localize_persistent(&session.globalize(*id)?)?;
                }
            }
        }
        let factory = context.find_model_resolver_factory(destination)?;
        let resolver = context.obtain_resolver(&factory)?;
        resolver.modify_model(destination, &statements, true)?;
        tracing::info!(
            destination = %self.destination_graph,
            inferred = statements.len(),
            "applied transitive rules"
        );
        Ok(statements.len() as u64)
    }

    fn destination_graph(&self) -> &str {
        &self.destination_graph
    }
}
