use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a document relative to one unit of work.
///
/// ```text
/// New --persist--> Managed --remove--> Removed
/// New --load-----> Managed
/// ```
///
/// `Removed` is terminal: the document is evicted from the identity map when
/// the removal is flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    /// Constructed by the caller and not yet known to the unit of work.
    New,
    /// Tracked in the identity map and eligible for change detection.
    Managed,
    /// Scheduled for deletion at the next flush.
    Removed,
}

impl DocumentState {
    pub fn is_new(self) -> bool {
        self == Self::New
    }

    pub fn is_managed(self) -> bool {
        self == Self::Managed
    }

    pub fn is_removed(self) -> bool {
        self == Self::Removed
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Managed => write!(f, "managed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(DocumentState::New.is_new());
        assert!(DocumentState::Managed.is_managed());
        assert!(DocumentState::Removed.is_removed());
        assert!(!DocumentState::Removed.is_managed());
    }

    #[test]
    fn display() {
        assert_eq!(DocumentState::Managed.to_string(), "managed");
    }
}
