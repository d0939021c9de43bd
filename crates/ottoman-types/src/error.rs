use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("expected a JSON object, got {0}")]
    NotAnObject(String),

    #[error("invalid revision token: {0:?}")]
    InvalidRevision(String),
}
