//! Class descriptors: how mapped Rust types become documents.

pub mod descriptor;
pub mod registry;

pub use descriptor::{
    AssociationKind, AssociationMapping, ClassDescriptor, DescriptorBuilder, FieldMapping, IdStrategy,
};
pub(crate) use descriptor::{AssociationValue, AssociationView};
pub use registry::MetadataRegistry;
