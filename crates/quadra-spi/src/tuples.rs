//! Materialized variable bindings.
//!
//! A [`Tuples`] value is a row set over an ordered list of variables. An
//! unbound column holds [`NodeId::NONE`], which is compatible with any value
//! when rows are joined.

use crate::constraint::Variable;
use crate::error::{Error, Result};
use crate::node::NodeId;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuples {
    variables: Vec<Variable>,
    rows: Vec<Vec<NodeId>>,
}

impl Tuples {
    pub fn new(variables: Vec<Variable>, rows: Vec<Vec<NodeId>>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|row| row.len() != variables.len()) {
            return Err(Error::Tuples(format!(
                "row width {} does not match {} variables",
                bad.len(),
                variables.len()
            )));
        }
        Ok(Self { variables, rows })
    }

    /// No rows at all.
    pub fn empty(variables: Vec<Variable>) -> Self {
        Self {
            variables,
            rows: Vec::new(),
        }
    }

    /// One row, no columns: the identity for [`Tuples::join`].
    pub fn unconstrained() -> Self {
        Self {
            variables: Vec::new(),
            rows: vec![Vec::new()],
        }
    }

    /// A single row binding `variable` to `value`.
    pub fn assign(variable: Variable, value: NodeId) -> Self {
        Self {
            variables: vec![variable],
            rows: vec![vec![value]],
        }
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn rows(&self) -> &[Vec<NodeId>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.variables.is_empty() && !self.rows.is_empty()
    }

    pub fn column_index(&self, variable: &Variable) -> Option<usize> {
        self.variables.iter().position(|v| v == variable)
    }

    pub fn value(&self, row: usize, column: usize) -> NodeId {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .copied()
            .unwrap_or(NodeId::NONE)
    }

    /// Natural join on shared variables.
    pub fn join(&self, other: &Tuples) -> Tuples {
        let mut variables = self.variables.clone();
        let mut carried = Vec::new();
        for (index, var) in other.variables.iter().enumerate() {
            if !variables.contains(var) {
                variables.push(var.clone());
                carried.push(index);
            }
        }
        let shared = shared_columns(&self.variables, &other.variables);

        let mut rows = Vec::new();
        for left in &self.rows {
            for right in &other.rows {
                if !compatible(left, right, &shared) {
                    continue;
                }
                let mut row = left.clone();
                for &(l, r) in &shared {
                    if row[l].is_none() {
                        row[l] = right[r];
                    }
                }
                row.extend(carried.iter().map(|&i| right[i]));
                rows.push(row);
            }
        }
        Tuples { variables, rows }
    }

    /// Like [`Tuples::join`], but a row of `self` with no compatible row in
    /// `optional` is kept once, with the optional columns unbound.
    pub fn left_join(&self, optional: &Tuples) -> Tuples {
        let joined = self.join(optional);
        let shared = shared_columns(&self.variables, &optional.variables);
        let width = joined.variables.len();
        let mut rows = Vec::with_capacity(joined.rows.len());
        let mut matched = joined.rows.into_iter().peekable();
        for left in &self.rows {
            let hits = optional
                .rows
                .iter()
                .filter(|right| compatible(left, right, &shared))
                .count();
            if hits == 0 {
                let mut row = left.clone();
                row.resize(width, NodeId::NONE);
                rows.push(row);
            } else {
                rows.extend(matched.by_ref().take(hits));
            }
        }
        Tuples {
            variables: joined.variables,
            rows,
        }
    }

    pub fn join_all<'a>(items: impl IntoIterator<Item = &'a Tuples>) -> Tuples {
        items
            .into_iter()
            .fold(Tuples::unconstrained(), |acc, next| acc.join(next))
    }

    /// Union of two row sets, padded to the union of their variables.
    /// Duplicate rows are dropped.
    pub fn append(&self, other: &Tuples) -> Tuples {
        let mut variables = self.variables.clone();
        for var in &other.variables {
            if !variables.contains(var) {
                variables.push(var.clone());
            }
        }
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for source in [self, other] {
            let mapping: Vec<Option<usize>> = variables
                .iter()
                .map(|v| source.column_index(v))
                .collect();
            for row in &source.rows {
                let padded: Vec<NodeId> = mapping
                    .iter()
                    .map(|m| m.map_or(NodeId::NONE, |i| row[i]))
                    .collect();
                if seen.insert(padded.clone()) {
                    rows.push(padded);
                }
            }
        }
        Tuples { variables, rows }
    }

    pub fn append_all<'a>(items: impl IntoIterator<Item = &'a Tuples>) -> Tuples {
        let mut iter = items.into_iter();
        let Some(first) = iter.next() else {
            return Tuples::empty(Vec::new());
        };
        iter.fold(first.clone(), |acc, next| acc.append(next))
    }

    /// Rows of `self` with no compatible row in `other`. With no shared
    /// variables nothing can be excluded and `self` is returned unchanged.
    pub fn subtract(&self, other: &Tuples) -> Tuples {
        let shared = shared_columns(&self.variables, &other.variables);
        if shared.is_empty() {
            return self.clone();
        }
        let rows = self
            .rows
            .iter()
            .filter(|left| !other.rows.iter().any(|right| compatible(left, right, &shared)))
            .cloned()
            .collect();
        Tuples {
            variables: self.variables.clone(),
            rows,
        }
    }

    /// Reorders columns to `variables`. Variables absent from `self` come out
    /// unbound.
    pub fn project(&self, variables: &[Variable]) -> Tuples {
        let mapping: Vec<Option<usize>> = variables.iter().map(|v| self.column_index(v)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                mapping
                    .iter()
                    .map(|m| m.map_or(NodeId::NONE, |i| row[i]))
                    .collect()
            })
            .collect();
        Tuples {
            variables: variables.to_vec(),
            rows,
        }
    }

    /// Keeps rows whose columns `a` and `b` hold the same value.
    pub fn filter_equal(&self, a: &Variable, b: &Variable) -> Result<Tuples> {
        let (Some(ia), Some(ib)) = (self.column_index(a), self.column_index(b)) else {
            return Err(Error::Tuples(format!("unknown variable in {a} = {b}")));
        };
        let rows = self
            .rows
            .iter()
            .filter(|row| row[ia] == row[ib])
            .cloned()
            .collect();
        Ok(Tuples {
            variables: self.variables.clone(),
            rows,
        })
    }

    pub fn distinct(mut self) -> Tuples {
        let mut seen = HashSet::new();
        self.rows.retain(|row| seen.insert(row.clone()));
        self
    }
}

fn shared_columns(left: &[Variable], right: &[Variable]) -> Vec<(usize, usize)> {
    left.iter()
        .enumerate()
        .filter_map(|(l, var)| right.iter().position(|v| v == var).map(|r| (l, r)))
        .collect()
}

fn compatible(left: &[NodeId], right: &[NodeId], shared: &[(usize, usize)]) -> bool {
    shared.iter().all(|&(l, r)| {
        let (a, b) = (left[l], right[r]);
        a.is_none() || b.is_none() || a == b
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(name: &str) -> Variable {
        Variable::new(name)
    }

    fn n(raw: i64) -> NodeId {
        NodeId::new(raw)
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = Tuples::new(vec![v("a"), v("b")], vec![vec![n(1)]]).unwrap_err();
        assert!(matches!(err, Error::Tuples(_)));
    }

    #[test]
    fn test_join_on_shared_variable() {
        let left = Tuples::new(vec![v("s"), v("o")], vec![vec![n(1), n(2)], vec![n(3), n(4)]]).unwrap();
        let right = Tuples::new(vec![v("o"), v("x")], vec![vec![n(2), n(9)]]).unwrap();
        let joined = left.join(&right);
        assert_eq!(joined.variables(), &[v("s"), v("o"), v("x")]);
        assert_eq!(joined.rows(), &[vec![n(1), n(2), n(9)]]);
    }

    #[test]
    fn test_unbound_column_joins_with_anything() {
        let left = Tuples::new(vec![v("a")], vec![vec![NodeId::NONE]]).unwrap();
        let right = Tuples::new(vec![v("a")], vec![vec![n(5)]]).unwrap();
        assert_eq!(left.join(&right).rows(), &[vec![n(5)]]);
    }

    #[test]
    fn test_append_pads_missing_columns() {
        let left = Tuples::assign(v("a"), n(1));
        let right = Tuples::assign(v("b"), n(2));
        let out = left.append(&right);
        assert_eq!(out.variables(), &[v("a"), v("b")]);
        assert_eq!(out.rows(), &[vec![n(1), NodeId::NONE], vec![NodeId::NONE, n(2)]]);
    }

    #[test]
    fn test_subtract_removes_matching_rows() {
        let left = Tuples::new(vec![v("a")], vec![vec![n(1)], vec![n(2)]]).unwrap();
        let right = Tuples::assign(v("a"), n(2));
        assert_eq!(left.subtract(&right).rows(), &[vec![n(1)]]);

        let disjoint = Tuples::assign(v("z"), n(2));
        assert_eq!(left.subtract(&disjoint), left);
    }

    #[test]
    fn test_left_join_keeps_unmatched_rows() {
        let people = Tuples::new(vec![v("p"), v("name")], vec![vec![n(1), n(10)], vec![n(2), n(20)]]).unwrap();
        let mail = Tuples::new(vec![v("p"), v("mbox")], vec![vec![n(1), n(100)], vec![n(1), n(101)]]).unwrap();
        let out = people.left_join(&mail);
        assert_eq!(out.variables(), &[v("p"), v("name"), v("mbox")]);
        assert_eq!(
            out.rows(),
            &[
                vec![n(1), n(10), n(100)],
                vec![n(1), n(10), n(101)],
                vec![n(2), n(20), NodeId::NONE],
            ]
        );
    }

    #[test]
    fn test_left_join_with_empty_optional_pads_every_row() {
        let people = Tuples::assign(v("p"), n(1));
        let out = people.left_join(&Tuples::empty(vec![v("p"), v("x")]));
        assert_eq!(out.rows(), &[vec![n(1), NodeId::NONE]]);
    }

    #[test]
    fn test_project_reorders_and_pads() {
        let t = Tuples::new(vec![v("a"), v("b")], vec![vec![n(1), n(2)]]).unwrap();
        let p = t.project(&[v("b"), v("c")]);
        assert_eq!(p.rows(), &[vec![n(2), NodeId::NONE]]);
    }

    fn tuples_strategy() -> impl Strategy<Value = Tuples> {
        prop::collection::vec(prop::collection::vec(1i64..6, 2), 0..8).prop_map(|rows| {
            let rows = rows.into_iter().map(|r| r.into_iter().map(NodeId::new).collect()).collect();
            Tuples::new(vec![Variable::new("a"), Variable::new("b")], rows).unwrap_or_default()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn join_with_unconstrained_is_identity(t in tuples_strategy()) {
            let joined = Tuples::unconstrained().join(&t);
            prop_assert_eq!(joined.rows(), t.rows());
        }

        #[test]
        fn left_join_keeps_every_left_row(a in tuples_strategy(), b in tuples_strategy()) {
            let out = a.left_join(&b);
            prop_assert!(out.row_count() >= a.row_count());
            for row in a.rows() {
                prop_assert!(out.rows().iter().any(|r| r[..2] == row[..]));
            }
        }

        #[test]
        fn subtract_never_grows(a in tuples_strategy(), b in tuples_strategy()) {
            prop_assert!(a.subtract(&b).row_count() <= a.row_count());
        }
    }
}
