use std::fmt;

use ottoman_client::ClientError;
use serde::{Deserialize, Serialize};

/// Errors raised while building or looking up class descriptors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("{document_type} declares no identifier field")]
    MissingIdentifier { document_type: String },

    #[error("{document_type} declares field {field} twice")]
    DuplicateField { document_type: String, field: String },

    #[error("{document_type} maps json key {key} twice")]
    DuplicateJsonKey { document_type: String, key: String },

    #[error("{document_type} maps field {field} to reserved key {key}")]
    ReservedKey {
        document_type: String,
        field: String,
        key: String,
    },

    #[error("document type {0} is already registered")]
    DuplicateType(String),

    #[error("unknown document type: {0}")]
    UnknownType(String),
}

/// One rejected document of a flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub identifier: String,
    pub error: String,
    pub reason: String,
}

impl fmt::Display for DocumentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.identifier, self.error, self.reason)
    }
}

/// Errors from the persistence engine.
#[derive(Debug, thiserror::Error)]
pub enum OdmError {
    /// An assigned-id document was persisted without an identifier.
    #[error("{document_type} has no identifier; assign one before persisting")]
    MissingIdentifier { document_type: String },

    /// Insertion was requested for a document the unit of work already tracks.
    #[error("{document_type} is already managed")]
    AlreadyManaged { document_type: String },

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// The unit of work does not track the given document.
    #[error("{document_type} is not managed by this unit of work")]
    UnmanagedDocument { document_type: String },

    /// One or more documents were rejected during a bulk write. Writes that
    /// succeeded in the same flush stay applied.
    #[error("flush failed for {} document(s): {}", .failures.len(), join(.failures))]
    FlushAggregate { failures: Vec<DocumentFailure> },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("expected document of type {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("document {0} carries no type metadata")]
    MissingTypeMetadata(String),

    #[error("identifier {0} is already mapped to another instance")]
    DuplicateIdentifier(String),

    /// The document is currently borrowed elsewhere.
    #[error("document is already borrowed")]
    DocumentBusy,

    #[error("unit of work is already in use")]
    UnitOfWorkBusy,

    /// A lazy reference outlived the manager that issued it.
    #[error("document manager has been dropped")]
    ManagerClosed,

    #[error("field {field}: {reason}")]
    Field { field: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl OdmError {
    /// Identifiers named by a [`OdmError::FlushAggregate`].
    pub fn failed_identifiers(&self) -> Vec<&str> {
        match self {
            Self::FlushAggregate { failures } => {
                failures.iter().map(|f| f.identifier.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn join(failures: &[DocumentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result alias for engine operations.
pub type OdmResult<T> = Result<T, OdmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ottoman_client::TransportError;

    #[test]
    fn aggregate_lists_every_failure() {
        let err = OdmError::FlushAggregate {
            failures: vec![
                DocumentFailure {
                    identifier: "a".into(),
                    error: "conflict".into(),
                    reason: "Document update conflict.".into(),
                },
                DocumentFailure {
                    identifier: "b".into(),
                    error: "forbidden".into(),
                    reason: String::new(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 document(s)"));
        assert!(msg.contains("a (conflict"));
        assert_eq!(err.failed_identifiers(), vec!["a", "b"]);
    }

    #[test]
    fn transport_errors_pass_through() {
        let err: OdmError = ClientError::from(TransportError::Unavailable("down".into())).into();
        assert_eq!(err.to_string(), "store unavailable: down");
    }

    #[test]
    fn mapping_errors_convert() {
        let err: OdmError = MappingError::UnknownType("Ghost".into()).into();
        assert!(matches!(err, OdmError::Mapping(MappingError::UnknownType(_))));
    }
}
