//! Shared document instances and lazy references.
//!
//! Every document the engine knows about lives in a [`Slot`]: the value in a
//! `RefCell`, plus a load state. A slot is either loaded or pending; a
//! pending slot carries the identifier to fetch and a loader that fills the
//! slot in place. [`Handle<T>`] is the typed, user-facing pointer to a slot;
//! the unit of work sees slots through the type-erased [`DocumentSlot`]
//! trait.

use std::any::{self, Any, TypeId};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::error::{OdmError, OdmResult};

/// Fills a pending slot. Receives the slot being resolved.
pub(crate) type Loader = Rc<dyn Fn(&Rc<dyn DocumentSlot>) -> OdmResult<()>>;

pub(crate) enum LoadState {
    Loaded,
    Pending { identifier: String, loader: Loader },
}

impl fmt::Debug for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded => f.write_str("Loaded"),
            Self::Pending { identifier, .. } => {
                f.debug_struct("Pending").field("identifier", identifier).finish_non_exhaustive()
            }
        }
    }
}

pub(crate) struct Slot<T> {
    value: RefCell<T>,
    state: RefCell<LoadState>,
}

impl<T: 'static> Slot<T> {
    pub(crate) fn new(value: T, state: LoadState) -> Self {
        Self {
            value: RefCell::new(value),
            state: RefCell::new(state),
        }
    }
}

/// Type-erased view of a slot used by the unit of work and the persister.
pub(crate) trait DocumentSlot {
    fn value(&self) -> OdmResult<Ref<'_, dyn Any + 'static>>;
    fn value_mut(&self) -> OdmResult<RefMut<'_, dyn Any + 'static>>;
    fn is_initialized(&self) -> bool;
    fn mark_initialized(&self);
    /// Identifier a pending slot will load, `None` once loaded.
    fn pending_identifier(&self) -> Option<String>;
    fn loader(&self) -> Option<Loader>;
    fn document_type(&self) -> TypeId;
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: 'static> DocumentSlot for Slot<T> {
    fn value(&self) -> OdmResult<Ref<'_, dyn Any + 'static>> {
        let guard = self.value.try_borrow().map_err(|_| OdmError::DocumentBusy)?;
        Ok(Ref::map(guard, |v| v as &(dyn Any + 'static)))
    }

    fn value_mut(&self) -> OdmResult<RefMut<'_, dyn Any + 'static>> {
        let guard = self.value.try_borrow_mut().map_err(|_| OdmError::DocumentBusy)?;
        Ok(RefMut::map(guard, |v| v as &mut (dyn Any + 'static)))
    }

    fn is_initialized(&self) -> bool {
        matches!(self.state.try_borrow().as_deref(), Ok(LoadState::Loaded))
    }

    fn mark_initialized(&self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            *state = LoadState::Loaded;
        }
    }

    fn pending_identifier(&self) -> Option<String> {
        match self.state.try_borrow().as_deref() {
            Ok(LoadState::Pending { identifier, .. }) => Some(identifier.clone()),
            _ => None,
        }
    }

    fn loader(&self) -> Option<Loader> {
        match self.state.try_borrow().as_deref() {
            Ok(LoadState::Pending { loader, .. }) => Some(loader.clone()),
            _ => None,
        }
    }

    fn document_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Address of a slot. Stable while the slot is alive.
pub(crate) type ObjectKey = usize;

pub(crate) fn object_key(slot: &Rc<dyn DocumentSlot>) -> ObjectKey {
    Rc::as_ptr(slot) as *const () as usize
}

/// Load a pending slot in place. No-op for loaded slots.
pub(crate) fn resolve(slot: &Rc<dyn DocumentSlot>) -> OdmResult<()> {
    match slot.loader() {
        Some(loader) => loader(slot),
        None => Ok(()),
    }
}

/// A shared reference to a document instance.
///
/// Clones point at the same instance; the identity map hands out clones of
/// one handle per stored document, so [`Handle::ptr_eq`] is the identity
/// test. A handle obtained from a reference or an association may be
/// *pending*: its data is fetched on the first [`read`](Handle::read) or
/// [`write`](Handle::write).
pub struct Handle<T: 'static> {
    slot: Rc<Slot<T>>,
}

impl<T: 'static> Handle<T> {
    /// Wrap a new, untracked document.
    pub fn new(value: T) -> Self {
        Self {
            slot: Rc::new(Slot::new(value, LoadState::Loaded)),
        }
    }

    /// Borrow the document, loading it first if pending.
    ///
    /// Fails with [`OdmError::DocumentNotFound`] if the referenced document
    /// no longer exists; the handle stays pending and may be retried.
    pub fn read(&self) -> OdmResult<Ref<'_, T>> {
        self.resolve()?;
        self.slot.value.try_borrow().map_err(|_| OdmError::DocumentBusy)
    }

    /// Mutably borrow the document, loading it first if pending.
    pub fn write(&self) -> OdmResult<RefMut<'_, T>> {
        self.resolve()?;
        self.slot
            .value
            .try_borrow_mut()
            .map_err(|_| OdmError::DocumentBusy)
    }

    /// `false` while the document data has not been fetched. Never loads.
    pub fn is_initialized(&self) -> bool {
        self.slot.is_initialized()
    }

    /// The identifier a pending handle will load.
    pub fn pending_identifier(&self) -> Option<String> {
        self.slot.pending_identifier()
    }

    /// `true` when both handles point at the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.slot, &b.slot)
    }

    pub(crate) fn resolve(&self) -> OdmResult<()> {
        resolve(&self.erased())
    }

    pub(crate) fn erased(&self) -> Rc<dyn DocumentSlot> {
        self.slot.clone()
    }

    pub(crate) fn key(&self) -> ObjectKey {
        object_key(&self.erased())
    }

    pub(crate) fn from_slot(slot: Rc<dyn DocumentSlot>) -> OdmResult<Self> {
        slot.into_any()
            .downcast::<Slot<T>>()
            .map(|slot| Self { slot })
            .map_err(|_| OdmError::TypeMismatch {
                expected: any::type_name::<T>().to_string(),
                found: "another document type".to_string(),
            })
    }
}

impl<T: 'static> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.pending_identifier() {
            Some(identifier) => f.debug_tuple("Handle").field(&format_args!("<pending {identifier}>")).finish(),
            None => match self.slot.value.try_borrow() {
                Ok(value) => f.debug_tuple("Handle").field(&*value).finish(),
                Err(_) => f.debug_tuple("Handle").field(&format_args!("<borrowed>")).finish(),
            },
        }
    }
}
