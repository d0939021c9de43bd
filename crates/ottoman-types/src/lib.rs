//! Foundation types for Ottoman, an object-document mapper for CouchDB-style
//! document stores.
//!
//! This crate holds the wire-level vocabulary shared by the store client and
//! the persistence engine. It has no knowledge of mapped Rust types.
//!
//! # Key Types
//!
//! - [`Revision`] -- Opaque version token issued by the store
//! - [`DocumentState`] -- Lifecycle state of a document inside a unit of work
//! - [`WireDocument`] -- A stored document as a JSON object, with reserved keys

pub mod error;
pub mod revision;
pub mod state;
pub mod wire;

pub use error::TypeError;
pub use revision::Revision;
pub use state::DocumentState;
pub use wire::{WireDocument, DELETED_KEY, ID_KEY, REV_KEY, TYPE_METADATA_KEY};
