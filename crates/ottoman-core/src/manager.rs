use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use ottoman_client::{CouchClient, Transport};
use ottoman_types::{DocumentState, Revision};
use tracing::{debug, info};

use crate::collection::CollectionLoader;
use crate::config::Configuration;
use crate::error::{OdmError, OdmResult};
use crate::handle::{DocumentSlot, Handle, Loader};
use crate::mapping::{ClassDescriptor, MetadataRegistry};
use crate::persister::{DocumentPersister, ReferenceResolver};
use crate::unit_of_work::{hydrate_detached, FlushReport, UnitOfWork};

/// Entry point of the persistence engine.
///
/// Owns one unit of work. Documents are handed out as [`Handle`]s; the same
/// stored document always maps to the same handle until [`clear`] is
/// called.
///
/// A manager and its handles are single-threaded (`!Send`). Share the
/// [`MetadataRegistry`] across threads and build one manager per thread.
///
/// [`clear`]: DocumentManager::clear
pub struct DocumentManager {
    ctx: Rc<Context>,
}

struct Context {
    config: Configuration,
    registry: Arc<MetadataRegistry>,
    persister: DocumentPersister,
    uow: RefCell<UnitOfWork>,
    /// Bumped on `clear`; loaders from an older generation load detached.
    generation: Cell<u64>,
    weak_self: Weak<Context>,
}

impl DocumentManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<MetadataRegistry>,
        config: Configuration,
    ) -> OdmResult<Self> {
        config.validate()?;
        let persister = DocumentPersister::new(CouchClient::new(transport), registry.clone(), &config);
        let ctx = Rc::new_cyclic(|weak_self| Context {
            uow: RefCell::new(UnitOfWork::new(config.uuid_buffer_size)),
            generation: Cell::new(0),
            weak_self: weak_self.clone(),
            persister,
            registry,
            config,
        });
        info!(db = %ctx.persister.database(), "document manager opened");
        Ok(Self { ctx })
    }

    // ---- Loading ----

    /// Load a document. `None` if the store does not have it.
    ///
    /// Always asks the store. If the document is already in the identity map
    /// the existing handle is returned and local state wins.
    pub fn find<T: 'static>(&self, id: &str) -> OdmResult<Option<Handle<T>>> {
        let descriptor = self.ctx.descriptor::<T>()?;
        let Some(wire) = self.ctx.persister.fetch(id)? else {
            return Ok(None);
        };
        let hydration = self.ctx.persister.deserialize(wire, Some(&descriptor), &*self.ctx)?;
        let slot = self.ctx.uow_mut()?.reconcile(hydration, None, false)?;
        Handle::from_slot(slot).map(Some)
    }

    /// Like [`find`](Self::find), failing with `DocumentNotFound`.
    pub fn get<T: 'static>(&self, id: &str) -> OdmResult<Handle<T>> {
        self.find(id)?
            .ok_or_else(|| OdmError::DocumentNotFound(id.to_string()))
    }

    /// Load several documents in one request. Missing ids are omitted.
    pub fn find_many<T: 'static>(&self, ids: &[&str]) -> OdmResult<Vec<Handle<T>>> {
        let descriptor = self.ctx.descriptor::<T>()?;
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for wire in self.ctx.persister.fetch_many(&ids)? {
            let hydration = self.ctx.persister.deserialize(wire, Some(&descriptor), &*self.ctx)?;
            let slot = self.ctx.uow_mut()?.reconcile(hydration, None, false)?;
            handles.push(Handle::from_slot(slot)?);
        }
        Ok(handles)
    }

    /// A handle for `id` without a request. Loads on first access.
    pub fn get_reference<T: 'static>(&self, id: &str) -> OdmResult<Handle<T>> {
        let descriptor = self.ctx.descriptor::<T>()?;
        let slot = self.ctx.reference(descriptor.name(), id)?;
        Handle::from_slot(slot)
    }

    // ---- Writing ----

    /// Schedule a new document for insertion and return its identifier.
    pub fn persist<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<String> {
        let descriptor = self.ctx.descriptor::<T>()?;
        self.ctx
            .uow_mut()?
            .schedule_insert(handle.erased(), descriptor, self.ctx.persister.client())
    }

    /// Track a document under a known identifier and revision. It is written
    /// in full at the next flush.
    pub fn attach<T: 'static>(
        &self,
        handle: &Handle<T>,
        id: &str,
        revision: Option<Revision>,
    ) -> OdmResult<()> {
        let descriptor = self.ctx.descriptor::<T>()?;
        self.ctx
            .uow_mut()?
            .attach(handle.erased(), descriptor, id.to_string(), revision)
    }

    /// Schedule a tracked document for deletion.
    pub fn remove<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<()> {
        let descriptor = self.ctx.descriptor::<T>()?;
        // The tombstone needs the current revision.
        handle.resolve()?;
        self.ctx
            .uow_mut()?
            .schedule_remove(handle.key(), descriptor.name())
    }

    /// Reload a tracked document from the store, discarding local changes.
    pub fn refresh<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<()> {
        let descriptor = self.ctx.descriptor::<T>()?;
        let id = self
            .ctx
            .uow()?
            .identifier_of(handle.key())
            .ok_or_else(|| unmanaged(&descriptor))?;
        let wire = self
            .ctx
            .persister
            .fetch(&id)?
            .ok_or_else(|| OdmError::DocumentNotFound(id.clone()))?;
        let hydration = self.ctx.persister.deserialize(wire, Some(&descriptor), &*self.ctx)?;
        self.ctx
            .uow_mut()?
            .reconcile(hydration, Some(handle.erased()), true)?;
        Ok(())
    }

    /// Write every pending change in one bulk request.
    pub fn flush(&self) -> OdmResult<FlushReport> {
        self.ctx.uow_mut()?.flush(&self.ctx.persister)
    }

    /// Forget every tracked document. Existing handles stay usable but are
    /// no longer managed.
    pub fn clear(&self) -> OdmResult<()> {
        let mut uow = self.ctx.uow_mut()?;
        let dropped = uow.managed_count();
        *uow = UnitOfWork::new(self.ctx.config.uuid_buffer_size);
        self.ctx.generation.set(self.ctx.generation.get() + 1);
        info!(dropped, "unit of work cleared");
        Ok(())
    }

    // ---- Inspection ----

    /// `true` for tracked documents not scheduled for removal.
    pub fn contains<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<bool> {
        Ok(self.state_of(handle)?.is_managed())
    }

    pub fn state_of<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<DocumentState> {
        Ok(self.ctx.uow()?.state_of(handle.key()))
    }

    pub fn identifier_of<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<String> {
        let descriptor = self.ctx.descriptor::<T>()?;
        self.ctx
            .uow()?
            .identifier_of(handle.key())
            .ok_or_else(|| unmanaged(&descriptor))
    }

    /// Last revision the store confirmed. `None` before the first flush.
    pub fn revision_of<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<Option<Revision>> {
        let descriptor = self.ctx.descriptor::<T>()?;
        self.ctx
            .uow()?
            .revision_of(handle.key())
            .ok_or_else(|| unmanaged(&descriptor))
    }

    /// Whether the next flush would write this document.
    pub fn has_changes<T: 'static>(&self, handle: &Handle<T>) -> OdmResult<bool> {
        let descriptor = self.ctx.descriptor::<T>()?;
        let uow = self.ctx.uow()?;
        if uow.identifier_of(handle.key()).is_none() {
            return Err(unmanaged(&descriptor));
        }
        uow.has_changes(handle.key())
    }

    pub fn managed_count(&self) -> OdmResult<usize> {
        Ok(self.ctx.uow()?.managed_count())
    }

    pub fn client(&self) -> &CouchClient {
        self.ctx.persister.client()
    }

    pub fn config(&self) -> &Configuration {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.ctx.registry
    }
}

impl std::fmt::Debug for DocumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentManager")
            .field("persister", &self.ctx.persister)
            .field("generation", &self.ctx.generation.get())
            .finish_non_exhaustive()
    }
}

fn unmanaged(descriptor: &ClassDescriptor) -> OdmError {
    OdmError::UnmanagedDocument {
        document_type: descriptor.name().to_string(),
    }
}

impl Context {
    fn descriptor<T: 'static>(&self) -> OdmResult<Arc<ClassDescriptor>> {
        Ok(self.registry.describe_type::<T>()?)
    }

    fn uow(&self) -> OdmResult<Ref<'_, UnitOfWork>> {
        self.uow.try_borrow().map_err(|_| OdmError::UnitOfWorkBusy)
    }

    fn uow_mut(&self) -> OdmResult<RefMut<'_, UnitOfWork>> {
        self.uow.try_borrow_mut().map_err(|_| OdmError::UnitOfWorkBusy)
    }

    fn document_loader(&self) -> Loader {
        let ctx = self.weak_self.clone();
        let generation = self.generation.get();
        Rc::new(move |slot: &Rc<dyn DocumentSlot>| -> OdmResult<()> {
            let ctx = ctx.upgrade().ok_or(OdmError::ManagerClosed)?;
            ctx.load_pending(slot, generation)
        })
    }

    fn load_pending(&self, slot: &Rc<dyn DocumentSlot>, generation: u64) -> OdmResult<()> {
        let Some(id) = slot.pending_identifier() else {
            return Ok(());
        };
        let descriptor = self.registry.describe_type_id(slot.document_type())?;
        let wire = self
            .persister
            .fetch(&id)?
            .ok_or_else(|| OdmError::DocumentNotFound(id.clone()))?;
        let hydration = self.persister.deserialize(wire, Some(&descriptor), self)?;

        if generation == self.generation.get() {
            self.uow_mut()?.reconcile(hydration, Some(slot.clone()), false)?;
        } else {
            debug!(id = %id, "loading reference from a cleared unit of work");
            hydrate_detached(&hydration, slot)?;
        }
        Ok(())
    }

    /// Members of a pending collection. Loaded instances are reused; the
    /// rest come from one bulk request.
    fn load_many(&self, target: &str, ids: &[String]) -> OdmResult<Vec<Rc<dyn DocumentSlot>>> {
        let descriptor = self.registry.describe(target)?;
        let mut found: HashMap<String, Rc<dyn DocumentSlot>> = HashMap::new();
        let mut missing = Vec::new();
        {
            let uow = self.uow()?;
            for id in ids {
                match uow.lookup(id) {
                    Some(slot) if slot.is_initialized() => {
                        found.insert(id.clone(), slot);
                    }
                    _ => missing.push(id.clone()),
                }
            }
        }

        for wire in self.persister.fetch_many(&missing)? {
            let hydration = self.persister.deserialize(wire, Some(&descriptor), self)?;
            let id = hydration.identifier.clone();
            let slot = self.uow_mut()?.reconcile(hydration, None, false)?;
            found.insert(id, slot);
        }
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }
}

impl ReferenceResolver for Context {
    fn reference(&self, target: &str, identifier: &str) -> OdmResult<Rc<dyn DocumentSlot>> {
        let descriptor = self.registry.describe(target)?;
        if let Some(slot) = self.uow()?.lookup(identifier) {
            if slot.document_type() != descriptor.type_id() {
                return Err(OdmError::TypeMismatch {
                    expected: descriptor.name().to_string(),
                    found: "another document type".into(),
                });
            }
            return Ok(slot);
        }

        let slot = descriptor.instantiate_pending(identifier.to_string(), self.document_loader());
        self.uow_mut()?
            .register_reference(slot.clone(), descriptor, identifier.to_string())?;
        Ok(slot)
    }

    fn collection_loader(&self, target: &str) -> CollectionLoader {
        let ctx = self.weak_self.clone();
        let target = target.to_string();
        Rc::new(move |ids: &[String]| -> OdmResult<Vec<Rc<dyn DocumentSlot>>> {
            let ctx = ctx.upgrade().ok_or(OdmError::ManagerClosed)?;
            ctx.load_many(&target, ids)
        })
    }
}
