use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Opaque version token issued by the store for one stored document.
///
/// The store hands out a new revision on every successful write. Writing a
/// document that already exists requires presenting its current revision;
/// a stale token is rejected as a conflict. The engine never interprets the
/// token beyond equality, but stores that follow the `N-hash` convention
/// expose their update counter through [`Revision::generation`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Parse a revision token. Empty tokens are rejected.
    pub fn parse(token: impl Into<String>) -> Result<Self, TypeError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(TypeError::InvalidRevision(token));
        }
        Ok(Self(token))
    }

    /// Build the `N-hash` form used by CouchDB-compatible stores.
    pub fn from_parts(generation: u64, digest: &str) -> Self {
        Self(format!("{generation}-{digest}"))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading update counter of an `N-hash` token, if present.
    pub fn generation(&self) -> Option<u64> {
        let (prefix, rest) = self.0.split_once('-')?;
        if rest.is_empty() {
            return None;
        }
        prefix.parse().ok()
    }

    /// The part after the first `-`, or the whole token.
    pub fn digest(&self) -> &str {
        self.0.split_once('-').map_or(self.0.as_str(), |(_, d)| d)
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Revision {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Revision {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_rejects_blank_tokens() {
        assert_eq!(
            Revision::parse("  "),
            Err(TypeError::InvalidRevision("  ".into()))
        );
        assert!(Revision::parse("1-abc").is_ok());
    }

    #[test]
    fn generation_of_couch_style_token() {
        let rev = Revision::from("12-4f6c0ad1");
        assert_eq!(rev.generation(), Some(12));
        assert_eq!(rev.digest(), "4f6c0ad1");
    }

    #[test]
    fn generation_of_opaque_token_is_none() {
        assert_eq!(Revision::from("opaque").generation(), None);
        assert_eq!(Revision::from("x-1").generation(), None);
        assert_eq!(Revision::from("3-").generation(), None);
        assert_eq!(Revision::from("opaque").digest(), "opaque");
    }

    #[test]
    fn serde_is_transparent() {
        let rev = Revision::from("2-ff");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"2-ff\"");
        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
    }

    #[test]
    fn display_and_debug() {
        let rev = Revision::from("1-a");
        assert_eq!(rev.to_string(), "1-a");
        assert_eq!(format!("{rev:?}"), "Revision(1-a)");
    }

    proptest! {
        #[test]
        fn from_parts_round_trips_generation(generation in 0u64..1_000_000, digest in "[0-9a-f]{1,32}") {
            let rev = Revision::from_parts(generation, &digest);
            prop_assert_eq!(rev.generation(), Some(generation));
            prop_assert_eq!(rev.digest(), digest.as_str());
        }
    }
}
