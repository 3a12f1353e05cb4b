//! Error taxonomy shared by every index source and the aggregator.

use std::collections::BTreeMap;
use thiserror::Error;

/// Per-source error descriptions keyed by source name.
pub type ErrorMap = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum IndexError {
    /// No matching records. Never a failure at the aggregate level.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed query parameters.
    #[error("bad query: {0}")]
    BadQuery(String),

    /// The source explicitly refused the query.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Deadline exceeded or circuit breaker open.
    #[error("timeout")]
    Timeout,

    /// Parse failure, connection failure, unexpected response.
    #[error("source error: {0}")]
    Source(String),

    /// Every dispatched source failed and nothing was produced.
    #[error("all sources failed ({} errors)", .0.len())]
    AllSourcesFailed(ErrorMap),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub fn bad_query(msg: impl Into<String>) -> Self {
        IndexError::BadQuery(msg.into())
    }

    pub fn source(msg: impl std::fmt::Display) -> Self {
        IndexError::Source(msg.to_string())
    }

    /// Short machine-friendly tag, used for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::NotFound(_) => "not_found",
            IndexError::BadQuery(_) => "bad_query",
            IndexError::AccessDenied(_) => "access_denied",
            IndexError::Timeout => "timeout",
            IndexError::Source(_) => "source",
            IndexError::AllSourcesFailed(_) => "all_failed",
            IndexError::Io(_) => "io",
        }
    }
}
