use std::any::{self, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use tracing::debug;

use crate::error::MappingError;
use crate::mapping::ClassDescriptor;

#[derive(Default)]
struct RegistryState {
    by_name: BTreeMap<String, Arc<ClassDescriptor>>,
    by_type: HashMap<TypeId, Arc<ClassDescriptor>>,
}

/// Class descriptors by type name and by Rust type.
///
/// Shared across managers behind an `Arc`. Descriptors are immutable once
/// registered.
#[derive(Default)]
pub struct MetadataRegistry {
    state: RwLock<RegistryState>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Names and Rust types must be unique.
    pub fn register(&self, descriptor: ClassDescriptor) -> Result<Arc<ClassDescriptor>, MappingError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.by_name.contains_key(descriptor.name())
            || state.by_type.contains_key(&descriptor.type_id())
        {
            return Err(MappingError::DuplicateType(descriptor.name().to_string()));
        }

        let descriptor = Arc::new(descriptor);
        debug!(
            document_type = descriptor.name(),
            fields = descriptor.fields().len(),
            associations = descriptor.associations().len(),
            "descriptor registered"
        );
        state
            .by_name
            .insert(descriptor.name().to_string(), descriptor.clone());
        state.by_type.insert(descriptor.type_id(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn describe(&self, name: &str) -> Result<Arc<ClassDescriptor>, MappingError> {
        self.read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| MappingError::UnknownType(name.to_string()))
    }

    pub fn describe_type<T: 'static>(&self) -> Result<Arc<ClassDescriptor>, MappingError> {
        self.lookup_type(TypeId::of::<T>())
            .ok_or_else(|| MappingError::UnknownType(any::type_name::<T>().to_string()))
    }

    pub(crate) fn describe_type_id(&self, type_id: TypeId) -> Result<Arc<ClassDescriptor>, MappingError> {
        self.lookup_type(type_id)
            .ok_or_else(|| MappingError::UnknownType(format!("{type_id:?}")))
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.read().by_name.keys().cloned().collect()
    }

    fn lookup_type(&self, type_id: TypeId) -> Option<Arc<ClassDescriptor>> {
        self.read().by_type.get(&type_id).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRegistry")
            .field("types", &self.names())
            .finish()
    }
}
