//! Local node identifiers and the global nodes they stand for.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// `rdf:type`, preallocated at bootstrap.
pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

/// Compact local identifier for a node.
///
/// Positive ids are persistent and outlive the transaction that allocated
/// them. Negative ids are ephemeral, scoped to a single localization session.
/// Zero is [`NodeId::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(i64);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);

    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_persistent(self) -> bool {
        self.0 > 0
    }

    pub fn is_ephemeral(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse classification used by string-pool type lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeCategory {
    Uri,
    Literal,
    Blank,
}

/// External representation of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GlobalNode {
    Uri(String),
    Literal {
        lexical: String,
        datatype: Option<String>,
        language: Option<String>,
    },
    Blank(String),
}

impl GlobalNode {
    pub fn uri(value: impl Into<String>) -> Self {
        GlobalNode::Uri(value.into())
    }

    pub fn literal(lexical: impl Into<String>) -> Self {
        GlobalNode::Literal {
            lexical: lexical.into(),
            datatype: None,
            language: None,
        }
    }

    pub fn typed_literal(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        GlobalNode::Literal {
            lexical: lexical.into(),
            datatype: Some(datatype.into()),
            language: None,
        }
    }

    pub fn category(&self) -> NodeCategory {
        match self {
            GlobalNode::Uri(_) => NodeCategory::Uri,
            GlobalNode::Literal { .. } => NodeCategory::Literal,
            GlobalNode::Blank(_) => NodeCategory::Blank,
        }
    }

    pub fn as_uri(&self) -> Option<&str> {
        match self {
            GlobalNode::Uri(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn datatype(&self) -> Option<&str> {
        match self {
            GlobalNode::Literal { datatype, .. } => datatype.as_deref(),
            _ => None,
        }
    }

    /// Orders two literals of the same datatype, numerically when both parse
    /// as numbers. Returns `None` for anything else.
    pub fn compare_literal(&self, other: &GlobalNode) -> Option<Ordering> {
        match (self, other) {
            (
                GlobalNode::Literal {
                    lexical: a,
                    datatype: da,
                    ..
                },
                GlobalNode::Literal {
                    lexical: b,
                    datatype: db,
                    ..
                },
            ) if da == db => match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y),
                _ => Some(a.cmp(b)),
            },
            _ => None,
        }
    }
}

impl fmt::Display for GlobalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalNode::Uri(uri) => write!(f, "<{uri}>"),
            GlobalNode::Literal {
                lexical,
                datatype,
                language,
            } => {
                write!(f, "\"{lexical}\"")?;
                if let Some(lang) = language {
                    write!(f, "@{lang}")
                } else if let Some(dt) = datatype {
                    write!(f, "^^<{dt}>")
                } else {
                    Ok(())
                }
            }
            GlobalNode::Blank(label) => write!(f, "_:{label}"),
        }
    }
}

/// A localized triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Statement {
    pub subject: NodeId,
    pub predicate: NodeId,
    pub object: NodeId,
}

impl Statement {
    pub fn new(subject: NodeId, predicate: NodeId, object: NodeId) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_classification() {
        assert!(NodeId::NONE.is_none());
        assert!(NodeId::new(7).is_persistent());
        assert!(NodeId::new(-3).is_ephemeral());
        assert!(!NodeId::new(-3).is_persistent());
    }

    #[test]
    fn test_literal_comparison_is_numeric_when_possible() {
        let xsd_int = "http://www.w3.org/2001/XMLSchema#int";
        let nine = GlobalNode::typed_literal("9", xsd_int);
        let ten = GlobalNode::typed_literal("10", xsd_int);
        assert_eq!(nine.compare_literal(&ten), Some(Ordering::Less));

        let plain = GlobalNode::literal("9");
        assert_eq!(nine.compare_literal(&plain), None);
    }

    #[test]
    fn test_display_matches_ntriples_terms() {
        assert_eq!(GlobalNode::uri("urn:a").to_string(), "<urn:a>");
        assert_eq!(GlobalNode::Blank("b1".into()).to_string(), "_:b1");
        let lang = GlobalNode::Literal {
            lexical: "chat".into(),
            datatype: None,
            language: Some("fr".into()),
        };
        assert_eq!(lang.to_string(), "\"chat\"@fr");
    }
}
