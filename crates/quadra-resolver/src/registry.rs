//! Constraint descriptor registry.
//!
//! Maps every constraint expression shape to a resolve handler and a rewrite
//! handler, and every graph expression shape to a graph handler. The table is
//! filled once at startup and checked with [`ConstraintRegistry::verify`];
//! using a shape with no handler is a configuration error.
//!
//! ```text
//!   Query ─┬─ GraphExpression ──► graph handler ─► rewrite(graph, expr)
//!          └─ ConstraintExpression ──► resolve handler ─► OperationContext::resolve
//! ```

use crate::context::OperationContext;
use quadra_spi::{
    ConstraintElement, ConstraintExpression, ConstraintShape, Error, GlobalNode, GraphExpression,
    GraphShape, Result, Tuples,
};
use std::collections::HashMap;
use std::sync::Arc;

pub type ResolveHandler = Arc<
    dyn Fn(
            &ConstraintRegistry,
            &dyn OperationContext,
            &GraphExpression,
            &ConstraintExpression,
        ) -> Result<Tuples>
        + Send
        + Sync,
>;

/// Re-targets an expression at a new graph element.
pub type RewriteHandler = Arc<
    dyn Fn(&ConstraintRegistry, &ConstraintElement, &ConstraintExpression) -> Result<ConstraintExpression>
        + Send
        + Sync,
>;

pub type GraphHandler = ResolveHandler;

#[derive(Clone)]
pub struct ConstraintDescriptor {
    pub shape: ConstraintShape,
    pub resolve: Option<ResolveHandler>,
    pub rewrite: Option<RewriteHandler>,
}

#[derive(Default)]
pub struct ConstraintRegistry {
    descriptors: HashMap<ConstraintShape, ConstraintDescriptor>,
    graphs: HashMap<GraphShape, GraphHandler>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with handlers for every built-in shape.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ConstraintDescriptor {
            shape: ConstraintShape::Pattern,
            resolve: Some(Arc::new(resolve_pattern)),
            rewrite: Some(Arc::new(rewrite_pattern)),
        });
        registry.register(ConstraintDescriptor {
            shape: ConstraintShape::Conjunction,
            resolve: Some(Arc::new(resolve_conjunction)),
            rewrite: Some(Arc::new(rewrite_operands)),
        });
        registry.register(ConstraintDescriptor {
            shape: ConstraintShape::Disjunction,
            resolve: Some(Arc::new(resolve_disjunction)),
            rewrite: Some(Arc::new(rewrite_operands)),
        });
        registry.register(ConstraintDescriptor {
            shape: ConstraintShape::Difference,
            resolve: Some(Arc::new(resolve_difference)),
            rewrite: Some(Arc::new(rewrite_operands)),
        });
        registry.register(ConstraintDescriptor {
            shape: ConstraintShape::OptionalJoin,
            resolve: Some(Arc::new(resolve_optional_join)),
            rewrite: Some(Arc::new(rewrite_operands)),
        });
        registry.register(ConstraintDescriptor {
            shape: ConstraintShape::Is,
            resolve: Some(Arc::new(resolve_is)),
            rewrite: Some(Arc::new(|_: &ConstraintRegistry, _: &ConstraintElement, expr: &ConstraintExpression| {
                Ok(expr.clone())
            })),
        });
        registry.register_graph(GraphShape::Resource, Arc::new(resolve_resource));
        registry.register_graph(GraphShape::Union, Arc::new(resolve_union));
        registry.register_graph(GraphShape::Intersection, Arc::new(resolve_intersection));
        registry.register_graph(GraphShape::Variable, Arc::new(resolve_graph_variable));
        registry
    }

    pub fn register(&mut self, descriptor: ConstraintDescriptor) {
        self.descriptors.insert(descriptor.shape, descriptor);
    }

    pub fn register_graph(&mut self, shape: GraphShape, handler: GraphHandler) {
        self.graphs.insert(shape, handler);
    }

    /// Fails unless every shape has both handlers and every graph shape has
    /// a handler.
    pub fn verify(&self) -> Result<()> {
        for shape in ConstraintShape::ALL {
            let descriptor = self.descriptors.get(&shape).ok_or_else(|| {
                Error::InvalidConfiguration(format!("no descriptor registered for {shape}"))
            })?;
            if descriptor.resolve.is_none() || descriptor.rewrite.is_none() {
                return Err(Error::InvalidConfiguration(format!(
                    "descriptor for {shape} is missing a handler"
                )));
            }
        }
        for shape in GraphShape::ALL {
            if !self.graphs.contains_key(&shape) {
                return Err(Error::InvalidConfiguration(format!(
                    "no graph handler registered for {shape:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn resolve(
        &self,
        context: &dyn OperationContext,
        graph: &GraphExpression,
        expression: &ConstraintExpression,
    ) -> Result<Tuples> {
        let shape = expression.shape();
        let handler = self
            .descriptors
            .get(&shape)
            .and_then(|d| d.resolve.as_ref())
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!("no resolve handler registered for {shape}"))
            })?;
        handler(self, context, graph, expression)
    }

    pub fn rewrite(
        &self,
        new_graph: &ConstraintElement,
        expression: &ConstraintExpression,
    ) -> Result<ConstraintExpression> {
        let shape = expression.shape();
        let handler = self
            .descriptors
            .get(&shape)
            .and_then(|d| d.rewrite.as_ref())
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!("no rewrite handler registered for {shape}"))
            })?;
        handler(self, new_graph, expression)
    }

    /// Resolves `expression` against the graphs named by `graph`.
    pub fn resolve_graph(
        &self,
        context: &dyn OperationContext,
        graph: &GraphExpression,
        expression: &ConstraintExpression,
    ) -> Result<Tuples> {
        let shape = graph.shape();
        let handler = self.graphs.get(&shape).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no graph handler registered for {shape:?}"))
        })?;
        handler(self, context, graph, expression)
    }
}

// ============================================================================
// Default constraint handlers
// ============================================================================

fn resolve_pattern(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let ConstraintExpression::Pattern(constraint) = expression else {
        return Err(Error::invalid_state("pattern handler given a compound expression"));
    };
    match constraint.graph() {
        ConstraintElement::Variable(v) if v.is_from_clause() => {
            registry.resolve_graph(context, graph, expression)
        }
        _ => context.resolve(constraint),
    }
}

fn rewrite_pattern(
    _registry: &ConstraintRegistry,
    new_graph: &ConstraintElement,
    expression: &ConstraintExpression,
) -> Result<ConstraintExpression> {
    match expression {
        ConstraintExpression::Pattern(constraint) => {
            // Patterns that already name a graph keep it.
            if constraint.graph().as_variable().is_some_and(|v| v.is_from_clause()) {
                Ok(ConstraintExpression::Pattern(constraint.with_graph(new_graph.clone())))
            } else {
                Ok(expression.clone())
            }
        }
        _ => Err(Error::invalid_state("pattern rewrite given a compound expression")),
    }
}

fn rewrite_operands(
    registry: &ConstraintRegistry,
    new_graph: &ConstraintElement,
    expression: &ConstraintExpression,
) -> Result<ConstraintExpression> {
    let rewrite_all = |items: &[ConstraintExpression]| -> Result<Vec<ConstraintExpression>> {
        items.iter().map(|item| registry.rewrite(new_graph, item)).collect()
    };
    match expression {
        ConstraintExpression::Conjunction(items) => Ok(ConstraintExpression::Conjunction(rewrite_all(items)?)),
        ConstraintExpression::Disjunction(items) => Ok(ConstraintExpression::Disjunction(rewrite_all(items)?)),
        ConstraintExpression::Difference(lhs, rhs) => Ok(ConstraintExpression::difference(
            registry.rewrite(new_graph, lhs)?,
            registry.rewrite(new_graph, rhs)?,
        )),
        ConstraintExpression::OptionalJoin(main, optional) => Ok(ConstraintExpression::optional_join(
            registry.rewrite(new_graph, main)?,
            registry.rewrite(new_graph, optional)?,
        )),
        other => Err(Error::invalid_state(format!(
            "operand rewrite given a {} expression",
            other.shape()
        ))),
    }
}

fn resolve_conjunction(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let ConstraintExpression::Conjunction(items) = expression else {
        return Err(Error::invalid_state("conjunction handler given another shape"));
    };
    let mut result = Tuples::unconstrained();
    for item in items {
        if result.is_empty() {
            break;
        }
        result = result.join(&registry.resolve(context, graph, item)?);
    }
    Ok(result)
}

fn resolve_disjunction(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let ConstraintExpression::Disjunction(items) = expression else {
        return Err(Error::invalid_state("disjunction handler given another shape"));
    };
    let operands = items
        .iter()
        .map(|item| registry.resolve(context, graph, item))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tuples::append_all(operands.iter()))
}

fn resolve_difference(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let ConstraintExpression::Difference(minuend, subtrahend) = expression else {
        return Err(Error::invalid_state("difference handler given another shape"));
    };
    let lhs = registry.resolve(context, graph, minuend)?;
    if lhs.is_empty() {
        return Ok(lhs);
    }
    let rhs = registry.resolve(context, graph, subtrahend)?;
    Ok(lhs.subtract(&rhs))
}

fn resolve_optional_join(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let ConstraintExpression::OptionalJoin(main, optional) = expression else {
        return Err(Error::invalid_state("optional join handler given another shape"));
    };
    let lhs = registry.resolve(context, graph, main)?;
    if lhs.is_empty() {
        return Ok(lhs.join(&Tuples::empty(optional.variables())));
    }
    let rhs = registry.resolve(context, graph, optional)?;
    Ok(lhs.left_join(&rhs))
}

fn resolve_is(
    _registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    _graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let ConstraintExpression::Is { variable, value } = expression else {
        return Err(Error::invalid_state("is handler given another shape"));
    };
    let id = context.session().localize(value)?;
    Ok(Tuples::assign(variable.clone(), id))
}

// ============================================================================
// Default graph handlers
// ============================================================================

fn resolve_resource(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let GraphExpression::Resource(uri) = graph else {
        return Err(Error::invalid_state("resource handler given a compound graph"));
    };
    let id = context.session().localize(&GlobalNode::uri(uri.as_str()))?;
    let rewritten = registry.rewrite(&ConstraintElement::Local(id), expression)?;
    registry.resolve(context, graph, &rewritten)
}

fn resolve_union(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let GraphExpression::Union(lhs, rhs) = graph else {
        return Err(Error::invalid_state("union handler given another graph shape"));
    };
    let left = registry.resolve_graph(context, lhs, expression)?;
    let right = registry.resolve_graph(context, rhs, expression)?;
    Ok(left.append(&right))
}

fn resolve_intersection(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let GraphExpression::Intersection(lhs, rhs) = graph else {
        return Err(Error::invalid_state("intersection handler given another graph shape"));
    };
    let left = registry.resolve_graph(context, lhs, expression)?;
    if left.is_empty() {
        return Ok(left);
    }
    let right = registry.resolve_graph(context, rhs, expression)?;
    Ok(left.join(&right))
}

/// Binds the graph position of every unbound pattern to the variable, so each
/// pattern ranges over all visible graphs.
fn resolve_graph_variable(
    registry: &ConstraintRegistry,
    context: &dyn OperationContext,
    graph: &GraphExpression,
    expression: &ConstraintExpression,
) -> Result<Tuples> {
    let GraphExpression::Variable(variable) = graph else {
        return Err(Error::invalid_state("graph variable handler given another graph shape"));
    };
    if variable.is_from_clause() {
        return Err(Error::Query(format!("{variable} cannot name a graph")));
    }
    let rewritten = registry.rewrite(&ConstraintElement::Variable(variable.clone()), expression)?;
    registry.resolve(context, graph, &rewritten)
}
