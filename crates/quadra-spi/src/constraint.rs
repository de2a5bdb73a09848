//! Constraint and graph expression trees handed to the core by the query planner.

use crate::node::{GlobalNode, NodeId};
use std::fmt;

/// Name reserved for the placeholder bound to the query's graph expression.
const FROM_VARIABLE: &str = "_from";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(String);

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Graph position of a pattern that should be resolved against the
    /// enclosing graph expression.
    pub fn from_clause() -> Self {
        Self(FROM_VARIABLE.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_from_clause(&self) -> bool {
        self.0 == FROM_VARIABLE
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// One position of a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstraintElement {
    Variable(Variable),
    Local(NodeId),
    Global(GlobalNode),
}

impl ConstraintElement {
    pub fn var(name: &str) -> Self {
        ConstraintElement::Variable(Variable::new(name))
    }

    pub fn uri(value: &str) -> Self {
        ConstraintElement::Global(GlobalNode::uri(value))
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            ConstraintElement::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_local(&self) -> Option<NodeId> {
        match self {
            ConstraintElement::Local(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<Variable> for ConstraintElement {
    fn from(value: Variable) -> Self {
        ConstraintElement::Variable(value)
    }
}

impl From<NodeId> for ConstraintElement {
    fn from(value: NodeId) -> Self {
        ConstraintElement::Local(value)
    }
}

impl From<GlobalNode> for ConstraintElement {
    fn from(value: GlobalNode) -> Self {
        ConstraintElement::Global(value)
    }
}

/// A single subject / predicate / object / graph pattern clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    elements: [ConstraintElement; 4],
}

impl Constraint {
    pub fn new(
        subject: impl Into<ConstraintElement>,
        predicate: impl Into<ConstraintElement>,
        object: impl Into<ConstraintElement>,
        graph: impl Into<ConstraintElement>,
    ) -> Self {
        Self {
            elements: [subject.into(), predicate.into(), object.into(), graph.into()],
        }
    }

    /// A pattern whose graph comes from the enclosing graph expression.
    pub fn pattern(
        subject: impl Into<ConstraintElement>,
        predicate: impl Into<ConstraintElement>,
        object: impl Into<ConstraintElement>,
    ) -> Self {
        Self::new(subject, predicate, object, Variable::from_clause())
    }

    pub fn subject(&self) -> &ConstraintElement {
        &self.elements[0]
    }

    pub fn predicate(&self) -> &ConstraintElement {
        &self.elements[1]
    }

    pub fn object(&self) -> &ConstraintElement {
        &self.elements[2]
    }

    pub fn graph(&self) -> &ConstraintElement {
        &self.elements[3]
    }

    pub fn element(&self, index: usize) -> &ConstraintElement {
        &self.elements[index]
    }

    pub fn elements(&self) -> &[ConstraintElement; 4] {
        &self.elements
    }

    pub fn with_graph(&self, graph: impl Into<ConstraintElement>) -> Self {
        let mut elements = self.elements.clone();
        elements[3] = graph.into();
        Self { elements }
    }

    pub fn with_elements(elements: [ConstraintElement; 4]) -> Self {
        Self { elements }
    }

    /// Distinct variables in position order. The from-clause placeholder is
    /// never a result column.
    pub fn variables(&self) -> Vec<Variable> {
        let mut out: Vec<Variable> = Vec::new();
        for element in &self.elements {
            if let ConstraintElement::Variable(v) = element {
                if !v.is_from_clause() && !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        out
    }
}

/// Closed set of constraint expression shapes known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintShape {
    Pattern,
    Conjunction,
    Disjunction,
    Difference,
    OptionalJoin,
    Is,
}

impl ConstraintShape {
    pub const ALL: [ConstraintShape; 6] = [
        ConstraintShape::Pattern,
        ConstraintShape::Conjunction,
        ConstraintShape::Disjunction,
        ConstraintShape::Difference,
        ConstraintShape::OptionalJoin,
        ConstraintShape::Is,
    ];
}

impl fmt::Display for ConstraintShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintShape::Pattern => "pattern",
            ConstraintShape::Conjunction => "conjunction",
            ConstraintShape::Disjunction => "disjunction",
            ConstraintShape::Difference => "difference",
            ConstraintShape::OptionalJoin => "optional join",
            ConstraintShape::Is => "is",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintExpression {
    Pattern(Constraint),
    Conjunction(Vec<ConstraintExpression>),
    Disjunction(Vec<ConstraintExpression>),
    /// Rows of the first operand with no compatible row in the second.
    Difference(Box<ConstraintExpression>, Box<ConstraintExpression>),
    /// Every row of the first operand, extended by the compatible rows of the
    /// second where there are any.
    OptionalJoin(Box<ConstraintExpression>, Box<ConstraintExpression>),
    /// Binds a variable to a fixed node.
    Is { variable: Variable, value: GlobalNode },
}

impl ConstraintExpression {
    pub fn shape(&self) -> ConstraintShape {
        match self {
            ConstraintExpression::Pattern(_) => ConstraintShape::Pattern,
            ConstraintExpression::Conjunction(_) => ConstraintShape::Conjunction,
            ConstraintExpression::Disjunction(_) => ConstraintShape::Disjunction,
            ConstraintExpression::Difference(_, _) => ConstraintShape::Difference,
            ConstraintExpression::OptionalJoin(_, _) => ConstraintShape::OptionalJoin,
            ConstraintExpression::Is { .. } => ConstraintShape::Is,
        }
    }

    pub fn difference(minuend: ConstraintExpression, subtrahend: ConstraintExpression) -> Self {
        ConstraintExpression::Difference(Box::new(minuend), Box::new(subtrahend))
    }

    pub fn optional_join(main: ConstraintExpression, optional: ConstraintExpression) -> Self {
        ConstraintExpression::OptionalJoin(Box::new(main), Box::new(optional))
    }

    pub fn variables(&self) -> Vec<Variable> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<Variable>) {
        let push = |v: Variable, out: &mut Vec<Variable>| {
            if !out.contains(&v) {
                out.push(v);
            }
        };
        match self {
            ConstraintExpression::Pattern(c) => {
                for v in c.variables() {
                    push(v, out);
                }
            }
            ConstraintExpression::Conjunction(items) | ConstraintExpression::Disjunction(items) => {
                for item in items {
                    item.collect_variables(out);
                }
            }
            ConstraintExpression::Difference(lhs, _) => lhs.collect_variables(out),
            ConstraintExpression::OptionalJoin(main, optional) => {
                main.collect_variables(out);
                optional.collect_variables(out);
            }
            ConstraintExpression::Is { variable, .. } => push(variable.clone(), out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphShape {
    Resource,
    Union,
    Intersection,
    Variable,
}

impl GraphShape {
    pub const ALL: [GraphShape; 4] = [
        GraphShape::Resource,
        GraphShape::Union,
        GraphShape::Intersection,
        GraphShape::Variable,
    ];
}

/// The `FROM` part of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphExpression {
    Resource(String),
    Union(Box<GraphExpression>, Box<GraphExpression>),
    Intersection(Box<GraphExpression>, Box<GraphExpression>),
    /// Every graph the caller can see, bound to the variable row by row.
    Variable(Variable),
}

impl GraphExpression {
    pub fn resource(uri: impl Into<String>) -> Self {
        GraphExpression::Resource(uri.into())
    }

    pub fn union(lhs: GraphExpression, rhs: GraphExpression) -> Self {
        GraphExpression::Union(Box::new(lhs), Box::new(rhs))
    }

    pub fn intersection(lhs: GraphExpression, rhs: GraphExpression) -> Self {
        GraphExpression::Intersection(Box::new(lhs), Box::new(rhs))
    }

    pub fn variable(name: &str) -> Self {
        GraphExpression::Variable(Variable::new(name))
    }

    pub fn shape(&self) -> GraphShape {
        match self {
            GraphExpression::Resource(_) => GraphShape::Resource,
            GraphExpression::Union(_, _) => GraphShape::Union,
            GraphExpression::Intersection(_, _) => GraphShape::Intersection,
            GraphExpression::Variable(_) => GraphShape::Variable,
        }
    }
}
