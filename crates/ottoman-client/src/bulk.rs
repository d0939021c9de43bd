//! Wire types of the `_bulk_docs` protocol.

use ottoman_types::{Revision, WireDocument};
use serde::{Deserialize, Serialize};

/// Body of a bulk write request.
///
/// Every entry is a full document body. Entries carrying `_rev` update that
/// revision, entries without one create, and entries with `_deleted: true`
/// delete. `all_or_nothing` asks the store to push every non-conflicting
/// change through instead of aborting the batch on the first conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkRequest {
    pub docs: Vec<WireDocument>,
    #[serde(default)]
    pub all_or_nothing: bool,
}

impl BulkRequest {
    pub fn new(docs: Vec<WireDocument>, all_or_nothing: bool) -> Self {
        Self {
            docs,
            all_or_nothing,
        }
    }
}

/// Per-document result of a bulk write, parallel to the request entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BulkOutcome {
    /// The store rejected this document.
    Failed {
        id: String,
        error: String,
        #[serde(default)]
        reason: String,
    },
    /// The write was applied and produced `rev`.
    Written { id: String, rev: Revision },
}

impl BulkOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Written { id, .. } | Self::Failed { id, .. } => id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    /// The new revision of a successful write.
    pub fn revision(&self) -> Option<&Revision> {
        match self {
            Self::Written { rev, .. } => Some(rev),
            Self::Failed { .. } => None,
        }
    }
}
