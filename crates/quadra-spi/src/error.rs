//! Error taxonomy shared by every Quadra crate.

use std::fmt;

/// Failures raised by resolvers, sessions and the transactional core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller supplied missing or contradictory construction parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Programming error: result read too early, wrong tag, unbalanced counts.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The graph does not exist, or the caller is not allowed to know it does.
    #[error("No such graph {0}")]
    NoSuchGraph(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("unsupported model type {0}")]
    UnsupportedModelType(String),

    #[error("graph {graph} already exists with model type {existing}")]
    TypeConflict { graph: String, existing: String },

    /// A constraint shape was used without a registered handler.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("unable to localize {0}")]
    Localize(String),

    #[error("node {0} not found")]
    Globalize(i64),

    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("tuples error: {0}")]
    Tuples(String),

    /// Fatal to the transaction; never retried by the core.
    #[error("{message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },
}

impl Error {
    pub fn transaction(message: impl Into<String>) -> Self {
        Error::Transaction {
            message: message.into(),
            source: None,
        }
    }

    pub fn transaction_caused_by(message: impl Into<String>, cause: Error) -> Self {
        Error::Transaction {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn invalid_state(message: impl fmt::Display) -> Self {
        Error::InvalidState(message.to_string())
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, Error::Transaction { .. })
    }

    /// Walks the source chain and returns the innermost error.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Error::Transaction {
            source: Some(inner),
            ..
        } = current
        {
            current = inner;
        }
        current
    }
}

pub type Result<T> = std::result::Result<T, Error>;
