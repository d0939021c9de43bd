use std::any::{self, Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use ottoman_types::{wire, Revision, ID_KEY};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::collection::{CollectionLoader, CollectionView, ReferenceCollection};
use crate::error::{MappingError, OdmError, OdmResult};
use crate::handle::{DocumentSlot, Handle, LoadState, Loader, Slot};

type Instantiate = Arc<dyn Fn(LoadState) -> Rc<dyn DocumentSlot> + Send + Sync>;
type IdGet = Arc<dyn Fn(&dyn Any) -> OdmResult<Option<String>> + Send + Sync>;
type IdSet = Arc<dyn Fn(&mut dyn Any, Option<String>) -> OdmResult<()> + Send + Sync>;
type ValueGet = Arc<dyn Fn(&dyn Any) -> OdmResult<Value> + Send + Sync>;
type ValueSet = Arc<dyn Fn(&mut dyn Any, Value) -> OdmResult<()> + Send + Sync>;
type VersionGet = Arc<dyn Fn(&dyn Any) -> OdmResult<Option<Revision>> + Send + Sync>;
type VersionSet = Arc<dyn Fn(&mut dyn Any, Option<Revision>) -> OdmResult<()> + Send + Sync>;
type OneGet = Arc<dyn Fn(&dyn Any) -> OdmResult<Option<Rc<dyn DocumentSlot>>> + Send + Sync>;
type OneSet = Arc<dyn Fn(&mut dyn Any, Option<Rc<dyn DocumentSlot>>) -> OdmResult<()> + Send + Sync>;
type ManyView = Arc<dyn Fn(&dyn Any) -> OdmResult<CollectionView> + Send + Sync>;
type ManySeed = Arc<dyn Fn(&mut dyn Any, Vec<String>, CollectionLoader) -> OdmResult<()> + Send + Sync>;
type ManyClean = Arc<dyn Fn(&dyn Any) -> OdmResult<()> + Send + Sync>;

/// How identifiers are obtained for new documents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdStrategy {
    /// Server-issued UUIDs, fetched in batches.
    #[default]
    Uuid,
    /// The caller sets the identifier before persisting.
    Assigned,
}

/// Kind of an association mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationKind {
    /// Stores the related identifier (or null).
    ReferenceOne,
    /// Owning side of a to-many: stores the related identifiers.
    ReferenceMany,
    /// Non-owning to-many. Declared only; never read or written.
    InverseMany,
}

/// A plain field: name, json key and erased accessors.
pub struct FieldMapping {
    name: String,
    json_key: String,
    get: ValueGet,
    set: ValueSet,
}

impl FieldMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_key(&self) -> &str {
        &self.json_key
    }

    pub(crate) fn read(&self, document: &dyn Any) -> OdmResult<Value> {
        (self.get)(document)
    }

    pub(crate) fn write(&self, document: &mut dyn Any, value: Value) -> OdmResult<()> {
        (self.set)(document, value)
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("name", &self.name)
            .field("json_key", &self.json_key)
            .finish_non_exhaustive()
    }
}

enum AssociationAccess {
    One { get: OneGet, set: OneSet },
    Many { view: ManyView, seed: ManySeed, clean: ManyClean },
    Inverse,
}

/// Current value of an association as seen by the unit of work.
pub(crate) enum AssociationView {
    One(Option<Rc<dyn DocumentSlot>>),
    Many(CollectionView),
}

/// A value to write into an association during hydration.
#[derive(Clone)]
pub(crate) enum AssociationValue {
    One(Option<Rc<dyn DocumentSlot>>),
    Many { ids: Vec<String>, loader: CollectionLoader },
}

/// An association: name, json key, target type name and erased accessors.
pub struct AssociationMapping {
    name: String,
    json_key: String,
    target: String,
    kind: AssociationKind,
    access: AssociationAccess,
}

impl AssociationMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_key(&self) -> &str {
        &self.json_key
    }

    /// Type name of the related documents.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    /// `None` for inverse associations.
    pub(crate) fn read(&self, document: &dyn Any) -> OdmResult<Option<AssociationView>> {
        match &self.access {
            AssociationAccess::One { get, .. } => Ok(Some(AssociationView::One(get(document)?))),
            AssociationAccess::Many { view, .. } => Ok(Some(AssociationView::Many(view(document)?))),
            AssociationAccess::Inverse => Ok(None),
        }
    }

    pub(crate) fn write(&self, document: &mut dyn Any, value: AssociationValue) -> OdmResult<()> {
        match (&self.access, value) {
            (AssociationAccess::One { set, .. }, AssociationValue::One(slot)) => set(document, slot),
            (AssociationAccess::Many { seed, .. }, AssociationValue::Many { ids, loader }) => {
                seed(document, ids, loader)
            }
            _ => Err(OdmError::Field {
                field: self.name.clone(),
                reason: "association value does not match its mapping".into(),
            }),
        }
    }

    /// Clear the structural-change flag of a to-many association.
    pub(crate) fn mark_clean(&self, document: &dyn Any) -> OdmResult<()> {
        match &self.access {
            AssociationAccess::Many { clean, .. } => clean(document),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for AssociationMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationMapping")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct IdentifierMapping {
    name: String,
    get: IdGet,
    set: IdSet,
}

struct VersionMapping {
    name: String,
    get: VersionGet,
    set: VersionSet,
}

/// Everything the engine knows about one mapped document type.
///
/// Built once through [`ClassDescriptor::builder`], then shared read-only
/// (`Arc`) by every manager that uses it. Field access goes through the
/// accessor functions registered on the builder.
pub struct ClassDescriptor {
    name: String,
    type_id: TypeId,
    rust_type: &'static str,
    id_strategy: IdStrategy,
    identifier: IdentifierMapping,
    version: Option<VersionMapping>,
    fields: Vec<FieldMapping>,
    associations: Vec<AssociationMapping>,
    instantiate: Instantiate,
}

impl ClassDescriptor {
    /// Start describing `T`. `factory` builds a blank instance for documents
    /// read from the store; user construction logic is not involved.
    pub fn builder<T: 'static>(
        name: impl Into<String>,
        factory: fn() -> T,
    ) -> DescriptorBuilder<T> {
        DescriptorBuilder {
            name: name.into(),
            factory,
            id_strategy: IdStrategy::default(),
            identifier: None,
            version: None,
            fields: Vec::new(),
            associations: Vec::new(),
        }
    }

    /// [`builder`](Self::builder) with `T::default` as the factory.
    pub fn builder_default<T: Default + 'static>(name: impl Into<String>) -> DescriptorBuilder<T> {
        Self::builder(name, T::default)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn id_strategy(&self) -> IdStrategy {
        self.id_strategy
    }

    pub fn identifier_field(&self) -> &str {
        &self.identifier.name
    }

    pub fn version_field(&self) -> Option<&str> {
        self.version.as_ref().map(|v| v.name.as_str())
    }

    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    pub fn associations(&self) -> &[AssociationMapping] {
        &self.associations
    }

    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub(crate) fn identifier_of(&self, document: &dyn Any) -> OdmResult<Option<String>> {
        (self.identifier.get)(document)
    }

    pub(crate) fn set_identifier(&self, document: &mut dyn Any, id: Option<String>) -> OdmResult<()> {
        (self.identifier.set)(document, id)
    }

    pub(crate) fn version_of(&self, document: &dyn Any) -> OdmResult<Option<Revision>> {
        match &self.version {
            Some(version) => (version.get)(document),
            None => Ok(None),
        }
    }

    /// Write the version field, if one is declared.
    pub(crate) fn set_version(&self, document: &mut dyn Any, rev: Option<Revision>) -> OdmResult<()> {
        match &self.version {
            Some(version) => (version.set)(document, rev),
            None => Ok(()),
        }
    }

    /// A blank, loaded instance.
    pub(crate) fn instantiate(&self) -> Rc<dyn DocumentSlot> {
        (self.instantiate)(LoadState::Loaded)
    }

    /// A blank instance that loads `identifier` on first access.
    pub(crate) fn instantiate_pending(&self, identifier: String, loader: Loader) -> Rc<dyn DocumentSlot> {
        (self.instantiate)(LoadState::Pending { identifier, loader })
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("rust_type", &self.rust_type)
            .field("id_strategy", &self.id_strategy)
            .field("fields", &self.fields)
            .field("associations", &self.associations)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ClassDescriptor`].
///
/// Accessors are plain function pointers, so non-capturing closures work:
///
/// ```ignore
/// ClassDescriptor::builder_default::<Article>("Article")
///     .identifier("id", |a| &a.id, |a| &mut a.id)
///     .field("title", |a| &a.title, |a| &mut a.title)
///     .reference_one::<User>("author", "User", |a| &a.author, |a| &mut a.author)
///     .build()?
/// ```
pub struct DescriptorBuilder<T: 'static> {
    name: String,
    factory: fn() -> T,
    id_strategy: IdStrategy,
    identifier: Option<IdentifierMapping>,
    version: Option<VersionMapping>,
    fields: Vec<FieldMapping>,
    associations: Vec<AssociationMapping>,
}

impl<T: 'static> DescriptorBuilder<T> {
    /// The identifier field, stored under `_id`.
    pub fn identifier(
        mut self,
        name: impl Into<String>,
        get: fn(&T) -> &Option<String>,
        get_mut: fn(&mut T) -> &mut Option<String>,
    ) -> Self {
        let type_name = self.name.clone();
        let set_name = self.name.clone();
        self.identifier = Some(IdentifierMapping {
            name: name.into(),
            get: Arc::new(move |doc: &dyn Any| -> OdmResult<Option<String>> {
                Ok(get(downcast::<T>(doc, &type_name)?).clone())
            }),
            set: Arc::new(move |doc: &mut dyn Any, id: Option<String>| -> OdmResult<()> {
                *get_mut(downcast_mut::<T>(doc, &set_name)?) = id;
                Ok(())
            }),
        });
        self
    }

    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// A plain field stored under its own name.
    pub fn field<F>(self, name: &str, get: fn(&T) -> &F, get_mut: fn(&mut T) -> &mut F) -> Self
    where
        F: Serialize + DeserializeOwned + 'static,
    {
        self.field_with_key(name, name, get, get_mut)
    }

    /// A plain field stored under `json_key`.
    pub fn field_with_key<F>(
        mut self,
        name: &str,
        json_key: &str,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> Self
    where
        F: Serialize + DeserializeOwned + 'static,
    {
        let type_name = self.name.clone();
        let get_field = name.to_string();
        let set_type = self.name.clone();
        let set_field = name.to_string();
        self.fields.push(FieldMapping {
            name: name.to_string(),
            json_key: json_key.to_string(),
            get: Arc::new(move |doc: &dyn Any| -> OdmResult<Value> {
                serde_json::to_value(get(downcast::<T>(doc, &type_name)?)).map_err(|e| {
                    OdmError::Field {
                        field: get_field.clone(),
                        reason: e.to_string(),
                    }
                })
            }),
            set: Arc::new(move |doc: &mut dyn Any, value: Value| -> OdmResult<()> {
                let parsed: F = serde_json::from_value(value).map_err(|e| OdmError::Field {
                    field: set_field.clone(),
                    reason: e.to_string(),
                })?;
                *get_mut(downcast_mut::<T>(doc, &set_type)?) = parsed;
                Ok(())
            }),
        });
        self
    }

    /// A field mirroring the store revision. Never compared or written as data.
    pub fn version(
        mut self,
        name: impl Into<String>,
        get: fn(&T) -> &Option<Revision>,
        get_mut: fn(&mut T) -> &mut Option<Revision>,
    ) -> Self {
        let type_name = self.name.clone();
        let set_name = self.name.clone();
        self.version = Some(VersionMapping {
            name: name.into(),
            get: Arc::new(move |doc: &dyn Any| -> OdmResult<Option<Revision>> {
                Ok(get(downcast::<T>(doc, &type_name)?).clone())
            }),
            set: Arc::new(move |doc: &mut dyn Any, rev: Option<Revision>| -> OdmResult<()> {
                *get_mut(downcast_mut::<T>(doc, &set_name)?) = rev;
                Ok(())
            }),
        });
        self
    }

    /// A to-one association to documents of type `target`.
    pub fn reference_one<U: 'static>(
        mut self,
        name: &str,
        target: &str,
        get: fn(&T) -> &Option<Handle<U>>,
        get_mut: fn(&mut T) -> &mut Option<Handle<U>>,
    ) -> Self {
        let type_name = self.name.clone();
        let set_name = self.name.clone();
        let access = AssociationAccess::One {
            get: Arc::new(move |doc: &dyn Any| -> OdmResult<Option<Rc<dyn DocumentSlot>>> {
                Ok(get(downcast::<T>(doc, &type_name)?).as_ref().map(Handle::erased))
            }),
            set: Arc::new(move |doc: &mut dyn Any, slot: Option<Rc<dyn DocumentSlot>>| -> OdmResult<()> {
                let handle = slot.map(Handle::<U>::from_slot).transpose()?;
                *get_mut(downcast_mut::<T>(doc, &set_name)?) = handle;
                Ok(())
            }),
        };
        self.push_association(name, target, AssociationKind::ReferenceOne, access);
        self
    }

    /// The owning side of a to-many association to documents of type `target`.
    pub fn reference_many<U: 'static>(
        mut self,
        name: &str,
        target: &str,
        get: fn(&T) -> &ReferenceCollection<U>,
        get_mut: fn(&mut T) -> &mut ReferenceCollection<U>,
    ) -> Self {
        let view_name = self.name.clone();
        let seed_name = self.name.clone();
        let clean_name = self.name.clone();
        let access = AssociationAccess::Many {
            view: Arc::new(move |doc: &dyn Any| -> OdmResult<CollectionView> {
                get(downcast::<T>(doc, &view_name)?).view()
            }),
            seed: Arc::new(move |doc: &mut dyn Any, ids: Vec<String>, loader: CollectionLoader| -> OdmResult<()> {
                *get_mut(downcast_mut::<T>(doc, &seed_name)?) = ReferenceCollection::pending(ids, loader);
                Ok(())
            }),
            clean: Arc::new(move |doc: &dyn Any| -> OdmResult<()> {
                get(downcast::<T>(doc, &clean_name)?).mark_clean();
                Ok(())
            }),
        };
        self.push_association(name, target, AssociationKind::ReferenceMany, access);
        self
    }

    /// The inverse side of a to-many association. Recorded in the mapping
    /// but never hydrated or serialized.
    pub fn inverse_many(mut self, name: &str, target: &str) -> Self {
        self.push_association(name, target, AssociationKind::InverseMany, AssociationAccess::Inverse);
        self
    }

    fn push_association(&mut self, name: &str, target: &str, kind: AssociationKind, access: AssociationAccess) {
        self.associations.push(AssociationMapping {
            name: name.to_string(),
            json_key: name.to_string(),
            target: target.to_string(),
            kind,
            access,
        });
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<ClassDescriptor, MappingError> {
        let identifier = self.identifier.ok_or_else(|| MappingError::MissingIdentifier {
            document_type: self.name.clone(),
        })?;

        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        names.insert(identifier.name.as_str());
        keys.insert(ID_KEY);
        if let Some(version) = &self.version {
            if !names.insert(version.name.as_str()) {
                return Err(MappingError::DuplicateField {
                    document_type: self.name.clone(),
                    field: version.name.clone(),
                });
            }
        }

        let mapped = self
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.json_key.as_str()))
            .chain(
                self.associations
                    .iter()
                    .map(|a| (a.name.as_str(), a.json_key.as_str())),
            );
        for (field, key) in mapped {
            if !names.insert(field) {
                return Err(MappingError::DuplicateField {
                    document_type: self.name.clone(),
                    field: field.to_string(),
                });
            }
            if wire::is_reserved(key) {
                return Err(MappingError::ReservedKey {
                    document_type: self.name.clone(),
                    field: field.to_string(),
                    key: key.to_string(),
                });
            }
            if !keys.insert(key) {
                return Err(MappingError::DuplicateJsonKey {
                    document_type: self.name.clone(),
                    key: key.to_string(),
                });
            }
        }

        let factory = self.factory;
        Ok(ClassDescriptor {
            name: self.name,
            type_id: TypeId::of::<T>(),
            rust_type: any::type_name::<T>(),
            id_strategy: self.id_strategy,
            identifier,
            version: self.version,
            fields: self.fields,
            associations: self.associations,
            instantiate: Arc::new(move |state: LoadState| -> Rc<dyn DocumentSlot> {
                Rc::new(Slot::new(factory(), state))
            }),
        })
    }
}

fn downcast<'a, T: 'static>(document: &'a dyn Any, type_name: &str) -> OdmResult<&'a T> {
    document.downcast_ref::<T>().ok_or_else(|| mismatch::<T>(type_name))
}

fn downcast_mut<'a, T: 'static>(document: &'a mut dyn Any, type_name: &str) -> OdmResult<&'a mut T> {
    document.downcast_mut::<T>().ok_or_else(|| mismatch::<T>(type_name))
}

fn mismatch<T>(type_name: &str) -> OdmError {
    OdmError::TypeMismatch {
        expected: format!("{type_name} ({})", any::type_name::<T>()),
        found: "another document type".into(),
    }
}
