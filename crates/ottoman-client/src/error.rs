use ottoman_types::TypeError;

/// Failures below the application protocol: the request did not produce a
/// usable response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The store could not be reached or the connection broke.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something that is not the expected JSON shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Result alias for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors from store client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure, passed through untouched.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The store answered with a non-success status.
    #[error("HTTP error with status {status} while requesting {path}: {error}: {reason}")]
    Http {
        status: u16,
        path: String,
        error: String,
        reason: String,
    },

    /// A single-document write was attempted without an `_id`.
    #[error("document has no _id")]
    MissingDocumentId,

    /// A document in the response could not be decoded.
    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

impl ClientError {
    /// The HTTP status for [`ClientError::Http`], `None` otherwise.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
