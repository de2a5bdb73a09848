//! Queries and the evaluator that runs them against an operation context.

use crate::context::OperationContext;
use quadra_spi::{ConstraintExpression, Error, GraphExpression, Result, Tuples, Variable};
use std::sync::Arc;

/// Upper bound on rewrite passes before evaluation gives up.
const MAX_TRANSFORMATION_PASSES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Ask,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: QueryKind,
    /// Projected variables; empty for ask queries.
    pub variables: Vec<Variable>,
    pub graph: GraphExpression,
    pub where_clause: ConstraintExpression,
    pub distinct: bool,
}

impl Query {
    pub fn select(
        variables: Vec<Variable>,
        graph: GraphExpression,
        where_clause: ConstraintExpression,
    ) -> Result<Self> {
        if variables.is_empty() {
            return Err(Error::InvalidArgument("select needs at least one variable".into()));
        }
        if let Some(v) = variables.iter().find(|v| v.is_from_clause()) {
            return Err(Error::InvalidArgument(format!("{v} cannot be projected")));
        }
        Ok(Self {
            kind: QueryKind::Select,
            variables,
            graph,
            where_clause,
            distinct: true,
        })
    }

    pub fn ask(graph: GraphExpression, where_clause: ConstraintExpression) -> Self {
        Self {
            kind: QueryKind::Ask,
            variables: Vec::new(),
            graph,
            where_clause,
            distinct: false,
        }
    }

    pub fn with_duplicates(mut self) -> Self {
        self.distinct = false;
        self
    }
}

/// Rewrites a constraint expression before evaluation. Returning `Some`
/// marks the expression modified and restarts the pipeline.
pub trait SymbolicTransformation: Send + Sync {
    fn transform(
        &self,
        context: &dyn OperationContext,
        expression: &ConstraintExpression,
    ) -> Result<Option<ConstraintExpression>>;
}

pub trait QueryEvaluator: Send + Sync {
    /// Evaluates `query` to localized tuples.
    fn evaluate(&self, context: &dyn OperationContext, query: &Query) -> Result<Tuples>;
}

/// Evaluates queries in-process through the constraint registry.
#[derive(Default)]
pub struct LocalQueryEvaluator {
    transformations: Vec<Arc<dyn SymbolicTransformation>>,
}

impl LocalQueryEvaluator {
    pub fn new(transformations: Vec<Arc<dyn SymbolicTransformation>>) -> Self {
        Self { transformations }
    }

    fn transform(
        &self,
        context: &dyn OperationContext,
        expression: ConstraintExpression,
    ) -> Result<ConstraintExpression> {
        let mut current = expression;
        for _ in 0..MAX_TRANSFORMATION_PASSES {
            let mut modified = None;
            for transformation in &self.transformations {
                if let Some(next) = transformation.transform(context, &current)? {
                    modified = Some(next);
                    break;
                }
            }
            match modified {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(Error::Query(format!(
            "symbolic transformations did not settle after {MAX_TRANSFORMATION_PASSES} passes"
        )))
    }
}

impl QueryEvaluator for LocalQueryEvaluator {
    fn evaluate(&self, context: &dyn OperationContext, query: &Query) -> Result<Tuples> {
        let expression = self.transform(context, query.where_clause.clone())?;
        tracing::trace!(kind = ?query.kind, shape = %expression.shape(), "evaluating query");
        let tuples = context
            .constraint_registry()
            .resolve(context, &query.graph, &expression)?;
        let tuples = match query.kind {
            QueryKind::Ask => tuples,
            QueryKind::Select => tuples.project(&query.variables),
        };
        Ok(if query.distinct { tuples.distinct() } else { tuples })
    }
}
