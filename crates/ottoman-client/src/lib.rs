//! Store client for Ottoman.
//!
//! The persistence engine talks to the document store through a single
//! synchronous request/response primitive, the [`Transport`] trait. On top of
//! it, [`CouchClient`] speaks the CouchDB document protocol: single-document
//! reads and writes, bulk reads through `_all_docs`, bulk writes through
//! `_bulk_docs`, server-issued UUIDs, and database administration.
//!
//! # Transports
//!
//! - [`InMemoryCouch`] -- in-process store emulator for tests and embedding
//!
//! Network transports live outside this crate; anything that can answer a
//! `(method, path, body)` request with a `(status, body)` response fits.
//!
//! # Design Rules
//!
//! 1. The transport never retries, redirects, or pools. That is its caller's
//!    (or its own implementation's) business.
//! 2. Transport failures are surfaced unchanged; they are never interpreted
//!    as document-level outcomes.
//! 3. A 404 on a single-document read is absence, not an error.
//! 4. Document-level write conflicts inside a bulk request come back as
//!    per-document outcomes, never as a failed request.

pub mod bulk;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod transport;

pub use bulk::{BulkOutcome, BulkRequest};
pub use client::{CouchClient, DatabaseInfo, WriteResponse};
pub use error::{ClientError, ClientResult, TransportError, TransportResult};
pub use memory::InMemoryCouch;
pub use transport::{Method, Response, Transport};
