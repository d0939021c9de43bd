//! Ottoman's persistence engine.
//!
//! Maps Rust values to documents in a CouchDB-style store and back. The
//! engine keeps one in-memory instance per stored document (the identity
//! map), detects changes by comparing against snapshots taken at load time,
//! writes every pending change in a single bulk request on flush, and defers
//! loading related documents until they are first read.
//!
//! # Key Types
//!
//! - [`DocumentManager`] -- Entry point: find, persist, remove, flush
//! - [`ClassDescriptor`] -- Per-type field and association accessor table
//! - [`MetadataRegistry`] -- Descriptors by name and Rust type
//! - [`Handle`] -- Shared reference to a document instance, possibly lazy
//! - [`ReferenceCollection`] -- Lazily materialized owning to-many association
//! - [`Configuration`] -- Database name, id batch size, bulk write mode
//!
//! # Usage
//!
//! ```ignore
//! let registry = Arc::new(MetadataRegistry::new());
//! registry.register(
//!     ClassDescriptor::builder_default::<User>("User")
//!         .identifier("id", |u| &u.id, |u| &mut u.id)
//!         .field("name", |u| &u.name, |u| &mut u.name)
//!         .build()?,
//! )?;
//!
//! let dm = DocumentManager::new(transport, registry, Configuration::default())?;
//! let user = Handle::new(User { name: "lsmith".into(), ..Default::default() });
//! dm.persist(&user)?;
//! dm.flush()?;
//! ```

pub mod collection;
pub mod config;
pub mod error;
pub mod handle;
pub mod id;
pub mod manager;
pub mod mapping;
pub mod persister;
pub mod unit_of_work;

pub use collection::ReferenceCollection;
pub use config::{BulkWriteMode, Configuration};
pub use error::{DocumentFailure, MappingError, OdmError, OdmResult};
pub use handle::Handle;
pub use id::{AssignedIdGenerator, IdGenerator, UuidIdGenerator};
pub use manager::DocumentManager;
pub use mapping::{AssociationKind, ClassDescriptor, DescriptorBuilder, IdStrategy, MetadataRegistry};
pub use persister::DocumentPersister;
pub use unit_of_work::{FlushReport, Snapshot, SnapshotValue};

pub use ottoman_client::{CouchClient, InMemoryCouch, Transport};
pub use ottoman_types::{DocumentState, Revision, WireDocument};
