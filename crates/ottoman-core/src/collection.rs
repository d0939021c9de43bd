use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::{OdmError, OdmResult};
use crate::handle::{DocumentSlot, Handle};

/// Bulk-loads the members of a pending collection. Missing ids are omitted.
pub(crate) type CollectionLoader = Rc<dyn Fn(&[String]) -> OdmResult<Vec<Rc<dyn DocumentSlot>>>>;

enum CollectionState<T: 'static> {
    Pending {
        ids: Vec<String>,
        added: Vec<Handle<T>>,
        loader: CollectionLoader,
    },
    Loaded(Vec<Handle<T>>),
}

/// What the unit of work needs from a collection without loading it.
pub(crate) struct CollectionView {
    /// Identifiers of members not yet loaded.
    pub ids: Vec<String>,
    /// Members present in memory, in order after `ids`.
    pub members: Vec<Rc<dyn DocumentSlot>>,
    pub changed: bool,
}

/// The owning side of a to-many association.
///
/// A collection read from the store starts pending: it knows its member
/// identifiers and fetches all of them in one bulk request on first access.
/// Members pushed before that are kept and appended after the loaded ones.
///
/// Structural changes (`push`, `remove`, `clear`) mark the collection
/// changed so the next flush rewrites the owning document.
pub struct ReferenceCollection<T: 'static> {
    state: RefCell<CollectionState<T>>,
    changed: Cell<bool>,
}

impl<T: 'static> ReferenceCollection<T> {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(CollectionState::Loaded(Vec::new())),
            changed: Cell::new(false),
        }
    }

    /// A collection holding `handles`, flagged as changed.
    pub fn from_handles(handles: Vec<Handle<T>>) -> Self {
        Self {
            state: RefCell::new(CollectionState::Loaded(handles)),
            changed: Cell::new(true),
        }
    }

    pub(crate) fn pending(ids: Vec<String>, loader: CollectionLoader) -> Self {
        let state = if ids.is_empty() {
            CollectionState::Loaded(Vec::new())
        } else {
            CollectionState::Pending {
                ids,
                added: Vec::new(),
                loader,
            }
        };
        Self {
            state: RefCell::new(state),
            changed: Cell::new(false),
        }
    }

    /// Append a member. Does not load.
    pub fn push(&mut self, handle: Handle<T>) {
        match self.state.get_mut() {
            CollectionState::Pending { added, .. } => added.push(handle),
            CollectionState::Loaded(members) => members.push(handle),
        }
        self.changed.set(true);
    }

    /// Remove every occurrence of `handle`. Returns whether one was found.
    pub fn remove(&mut self, handle: &Handle<T>) -> OdmResult<bool> {
        self.materialize()?;
        let CollectionState::Loaded(members) = self.state.get_mut() else {
            return Ok(false);
        };
        let before = members.len();
        members.retain(|member| !Handle::ptr_eq(member, handle));
        let removed = members.len() != before;
        if removed {
            self.changed.set(true);
        }
        Ok(removed)
    }

    pub fn clear(&mut self) {
        *self.state.get_mut() = CollectionState::Loaded(Vec::new());
        self.changed.set(true);
    }

    /// The members, loading them if needed.
    pub fn to_vec(&self) -> OdmResult<Vec<Handle<T>>> {
        self.materialize()?;
        match &*self.state.try_borrow().map_err(|_| OdmError::DocumentBusy)? {
            CollectionState::Loaded(members) => Ok(members.clone()),
            CollectionState::Pending { .. } => Ok(Vec::new()),
        }
    }

    pub fn len(&self) -> OdmResult<usize> {
        self.materialize()?;
        match &*self.state.try_borrow().map_err(|_| OdmError::DocumentBusy)? {
            CollectionState::Loaded(members) => Ok(members.len()),
            CollectionState::Pending { .. } => Ok(0),
        }
    }

    pub fn is_empty(&self) -> OdmResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, handle: &Handle<T>) -> OdmResult<bool> {
        Ok(self
            .to_vec()?
            .iter()
            .any(|member| Handle::ptr_eq(member, handle)))
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state.try_borrow().as_deref(),
            Ok(CollectionState::Loaded(_))
        )
    }

    pub fn is_changed(&self) -> bool {
        self.changed.get()
    }

    /// Member identifiers known without loading: the seeded ids of a
    /// pending collection, empty once loaded.
    pub fn identifiers_hint(&self) -> Vec<String> {
        match self.state.try_borrow().as_deref() {
            Ok(CollectionState::Pending { ids, .. }) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn view(&self) -> OdmResult<CollectionView> {
        let state = self.state.try_borrow().map_err(|_| OdmError::DocumentBusy)?;
        let (ids, members) = match &*state {
            CollectionState::Pending { ids, added, .. } => {
                (ids.clone(), added.iter().map(Handle::erased).collect::<Vec<_>>())
            }
            CollectionState::Loaded(members) => {
                (Vec::new(), members.iter().map(Handle::erased).collect::<Vec<_>>())
            }
        };
        Ok(CollectionView {
            ids,
            members,
            changed: self.changed.get(),
        })
    }

    pub(crate) fn mark_clean(&self) {
        self.changed.set(false);
    }

    fn materialize(&self) -> OdmResult<()> {
        let (ids, loader) = match &*self.state.try_borrow().map_err(|_| OdmError::DocumentBusy)? {
            CollectionState::Loaded(_) => return Ok(()),
            CollectionState::Pending { ids, loader, .. } => (ids.clone(), loader.clone()),
        };

        let mut loaded = loader(&ids)?
            .into_iter()
            .map(Handle::from_slot)
            .collect::<OdmResult<Vec<_>>>()?;

        let mut state = self.state.try_borrow_mut().map_err(|_| OdmError::DocumentBusy)?;
        if let CollectionState::Pending { added, .. } = &mut *state {
            loaded.append(added);
        }
        *state = CollectionState::Loaded(loaded);
        Ok(())
    }
}

impl<T: 'static> Default for ReferenceCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for ReferenceCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ReferenceCollection");
        match self.state.try_borrow().as_deref() {
            Ok(CollectionState::Pending { ids, added, .. }) => {
                out.field("pending", ids).field("added", &added.len())
            }
            Ok(CollectionState::Loaded(members)) => out.field("loaded", &members.len()),
            Err(_) => out.field("state", &"<borrowed>"),
        };
        out.field("changed", &self.changed.get()).finish()
    }
}
