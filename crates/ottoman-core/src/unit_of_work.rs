//! Identity map and unit of work.
//!
//! The unit of work tracks every document instance it has handed out or
//! been given, keyed by the address of its slot. It remembers what each
//! document looked like when loaded (the snapshot), finds what changed at
//! flush time, and writes everything in one bulk request.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use ottoman_client::{BulkOutcome, CouchClient};
use ottoman_types::{DocumentState, Revision, WireDocument};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{DocumentFailure, OdmError, OdmResult};
use crate::handle::{object_key, DocumentSlot, ObjectKey};
use crate::id::{AssignedIdGenerator, IdGenerator, UuidIdGenerator};
use crate::mapping::{AssociationView, ClassDescriptor, IdStrategy};
use crate::persister::{DocumentPersister, Hydration};

/// Field name to captured value.
pub type Snapshot = BTreeMap<String, SnapshotValue>;

/// One captured field or association.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotValue {
    Field(Value),
    /// Identifier of the related document, if any.
    Reference(Option<String>),
    /// Identifiers of the members of an owning to-many association.
    References(Vec<String>),
}

/// What a successful flush wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Documents created or updated.
    pub written: usize,
    /// Documents deleted in the store.
    pub deleted: usize,
}

struct ManagedRecord {
    sequence: u64,
    identifier: String,
    revision: Option<Revision>,
    state: DocumentState,
    snapshot: Option<Snapshot>,
    changeset: Option<Snapshot>,
    descriptor: Arc<ClassDescriptor>,
    slot: Rc<dyn DocumentSlot>,
}

enum FlushTarget {
    Write { key: ObjectKey, identifier: String },
    Delete { identifier: String },
}

impl FlushTarget {
    fn identifier(&self) -> &str {
        match self {
            Self::Write { identifier, .. } | Self::Delete { identifier } => identifier,
        }
    }
}

pub(crate) struct UnitOfWork {
    identity_map: HashMap<String, ObjectKey>,
    records: HashMap<ObjectKey, ManagedRecord>,
    scheduled_inserts: HashSet<ObjectKey>,
    scheduled_updates: Vec<ObjectKey>,
    scheduled_removals: Vec<ObjectKey>,
    next_sequence: u64,
    uuid_generator: UuidIdGenerator,
    assigned_generator: AssignedIdGenerator,
}

impl UnitOfWork {
    pub fn new(uuid_batch_size: usize) -> Self {
        Self {
            identity_map: HashMap::new(),
            records: HashMap::new(),
            scheduled_inserts: HashSet::new(),
            scheduled_updates: Vec::new(),
            scheduled_removals: Vec::new(),
            next_sequence: 0,
            uuid_generator: UuidIdGenerator::new(uuid_batch_size),
            assigned_generator: AssignedIdGenerator,
        }
    }

    // ---- Queries ----

    /// The instance registered for `identifier`.
    pub fn lookup(&self, identifier: &str) -> Option<Rc<dyn DocumentSlot>> {
        let key = self.identity_map.get(identifier)?;
        self.records.get(key).map(|record| record.slot.clone())
    }

    /// Lifecycle state; untracked documents are `New`.
    pub fn state_of(&self, key: ObjectKey) -> DocumentState {
        self.records
            .get(&key)
            .map_or(DocumentState::New, |record| record.state)
    }

    pub fn identifier_of(&self, key: ObjectKey) -> Option<String> {
        self.records.get(&key).map(|record| record.identifier.clone())
    }

    /// `None` for untracked documents, `Some(None)` before the first write.
    pub fn revision_of(&self, key: ObjectKey) -> Option<Option<Revision>> {
        self.records.get(&key).map(|record| record.revision.clone())
    }

    pub fn managed_count(&self) -> usize {
        self.identity_map.len()
    }

    /// Dry-run change detection for one tracked document.
    pub fn has_changes(&self, key: ObjectKey) -> OdmResult<bool> {
        Ok(self.detect(key)?.is_some())
    }

    // ---- Registration ----

    /// Register a new document for insertion at the next flush.
    pub fn schedule_insert(
        &mut self,
        slot: Rc<dyn DocumentSlot>,
        descriptor: Arc<ClassDescriptor>,
        client: &CouchClient,
    ) -> OdmResult<String> {
        let key = object_key(&slot);
        if self.records.contains_key(&key) {
            return Err(OdmError::AlreadyManaged {
                document_type: descriptor.name().to_string(),
            });
        }

        let (identifier, previous) = {
            let mut value = slot.value_mut()?;
            let previous = descriptor.identifier_of(&*value)?;
            let identifier = match descriptor.id_strategy() {
                IdStrategy::Uuid => self.uuid_generator.generate(&mut *value, &descriptor, client)?,
                IdStrategy::Assigned => {
                    self.assigned_generator
                        .generate(&mut *value, &descriptor, client)?
                }
            };
            (identifier, previous)
        };

        let captured = if self.identity_map.contains_key(&identifier) {
            Err(OdmError::DuplicateIdentifier(identifier.clone()))
        } else {
            self.capture(&descriptor, &slot, false)
        };
        let snapshot = match captured {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // A rejected insert leaves the caller's identifier as it was.
                descriptor.set_identifier(&mut *slot.value_mut()?, previous)?;
                return Err(e);
            }
        };
        debug!(document_type = descriptor.name(), id = %identifier, "scheduled for insert");
        self.register(slot, descriptor, identifier.clone(), None, Some(snapshot));
        self.scheduled_inserts.insert(key);
        Ok(identifier)
    }

    /// Track a document under a known identifier without a snapshot. It is
    /// written in full at the next flush.
    pub fn attach(
        &mut self,
        slot: Rc<dyn DocumentSlot>,
        descriptor: Arc<ClassDescriptor>,
        identifier: String,
        revision: Option<Revision>,
    ) -> OdmResult<()> {
        if self.records.contains_key(&object_key(&slot)) {
            return Err(OdmError::AlreadyManaged {
                document_type: descriptor.name().to_string(),
            });
        }
        if self.identity_map.contains_key(&identifier) {
            return Err(OdmError::DuplicateIdentifier(identifier));
        }
        {
            let mut value = slot.value_mut()?;
            descriptor.set_identifier(&mut *value, Some(identifier.clone()))?;
            descriptor.set_version(&mut *value, revision.clone())?;
        }
        self.register(slot, descriptor, identifier, revision, None);
        Ok(())
    }

    /// Track a pending reference. It is skipped by change detection until
    /// loaded.
    pub fn register_reference(
        &mut self,
        slot: Rc<dyn DocumentSlot>,
        descriptor: Arc<ClassDescriptor>,
        identifier: String,
    ) -> OdmResult<()> {
        if self.identity_map.contains_key(&identifier) {
            return Err(OdmError::DuplicateIdentifier(identifier));
        }
        self.register(slot, descriptor, identifier, None, None);
        Ok(())
    }

    fn register(
        &mut self,
        slot: Rc<dyn DocumentSlot>,
        descriptor: Arc<ClassDescriptor>,
        identifier: String,
        revision: Option<Revision>,
        snapshot: Option<Snapshot>,
    ) {
        let key = object_key(&slot);
        self.next_sequence += 1;
        self.identity_map.insert(identifier.clone(), key);
        self.records.insert(
            key,
            ManagedRecord {
                sequence: self.next_sequence,
                identifier,
                revision,
                state: DocumentState::Managed,
                snapshot,
                changeset: None,
                descriptor,
                slot,
            },
        );
    }

    // ---- Reconciliation ----

    /// Merge a loaded record into the identity map.
    ///
    /// Reuses `target` or the registered instance, else instantiates one.
    /// Fields are overwritten only for fresh instances, pending references,
    /// or when `refresh` is set; otherwise local edits win.
    pub fn reconcile(
        &mut self,
        hydration: Hydration,
        target: Option<Rc<dyn DocumentSlot>>,
        refresh: bool,
    ) -> OdmResult<Rc<dyn DocumentSlot>> {
        let descriptor = hydration.descriptor.clone();
        let (slot, overwrite) = match target.or_else(|| self.lookup(&hydration.identifier)) {
            Some(slot) => {
                if slot.document_type() != descriptor.type_id() {
                    return Err(OdmError::TypeMismatch {
                        expected: descriptor.name().to_string(),
                        found: self
                            .records
                            .get(&object_key(&slot))
                            .map_or("another document type", |r| r.descriptor.name())
                            .to_string(),
                    });
                }
                let overwrite = refresh || !slot.is_initialized();
                (slot, overwrite)
            }
            None => (descriptor.instantiate(), true),
        };

        let key = object_key(&slot);
        let tracked = self.records.contains_key(&key);
        if !tracked && self.identity_map.contains_key(&hydration.identifier) {
            return Err(OdmError::DuplicateIdentifier(hydration.identifier));
        }

        if !overwrite {
            if !tracked {
                self.register(slot.clone(), descriptor, hydration.identifier, None, None);
            }
            return Ok(slot);
        }

        // Untracked instances are registered only once fully hydrated.
        apply(&hydration, &slot)?;
        let snapshot = self.capture(&descriptor, &slot, false)?;
        debug!(document_type = descriptor.name(), id = %hydration.identifier, refresh, "document hydrated");
        match self.records.get_mut(&key) {
            Some(record) => {
                record.revision = hydration.revision;
                record.snapshot = Some(snapshot);
                record.changeset = None;
            }
            None => self.register(
                slot.clone(),
                descriptor,
                hydration.identifier,
                hydration.revision,
                Some(snapshot),
            ),
        }
        Ok(slot)
    }

    // ---- Removal ----

    pub fn schedule_remove(&mut self, key: ObjectKey, document_type: &str) -> OdmResult<()> {
        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| OdmError::UnmanagedDocument {
                document_type: document_type.to_string(),
            })?;
        if record.state.is_removed() {
            return Ok(());
        }
        record.state = DocumentState::Removed;
        self.scheduled_updates.retain(|k| *k != key);
        self.scheduled_inserts.remove(&key);
        self.scheduled_removals.push(key);
        Ok(())
    }

    // ---- Change detection ----

    /// Schedule an update for every dirty managed document.
    pub fn compute_change_sets(&mut self) -> OdmResult<()> {
        for key in self.ordered_keys() {
            let Some(changeset) = self.detect(key)? else {
                continue;
            };
            if let Some(record) = self.records.get_mut(&key) {
                record.changeset = Some(changeset);
            }
            if !self.scheduled_updates.contains(&key) {
                self.scheduled_updates.push(key);
            }
        }
        Ok(())
    }

    /// The full current field map if the document needs writing.
    fn detect(&self, key: ObjectKey) -> OdmResult<Option<Snapshot>> {
        let record = self
            .records
            .get(&key)
            .ok_or_else(|| OdmError::UnmanagedDocument {
                document_type: "unknown".into(),
            })?;
        if !record.state.is_managed() || !record.slot.is_initialized() {
            return Ok(None);
        }

        let current = self.capture(&record.descriptor, &record.slot, true)?;
        let dirty = self.scheduled_inserts.contains(&key)
            || record
                .snapshot
                .as_ref()
                .map_or(true, |snapshot| !same_fields(snapshot, &current))
            || collections_changed(&record.descriptor, &record.slot)?;
        Ok(dirty.then_some(current))
    }

    fn capture(
        &self,
        descriptor: &ClassDescriptor,
        slot: &Rc<dyn DocumentSlot>,
        strict: bool,
    ) -> OdmResult<Snapshot> {
        let value = slot.value()?;
        let mut snapshot = Snapshot::new();
        for field in descriptor.fields() {
            snapshot.insert(field.name().to_string(), SnapshotValue::Field(field.read(&*value)?));
        }

        for association in descriptor.associations() {
            let target = association.target();
            let captured = match association.read(&*value)? {
                None => continue,
                Some(AssociationView::One(None)) => SnapshotValue::Reference(None),
                Some(AssociationView::One(Some(related))) => {
                    match self.related_identifier(&related, target, strict)? {
                        Some(id) => SnapshotValue::Reference(Some(id)),
                        None => continue,
                    }
                }
                Some(AssociationView::Many(view)) => {
                    let mut ids = view.ids;
                    for member in &view.members {
                        if let Some(id) = self.related_identifier(member, target, strict)? {
                            ids.push(id);
                        }
                    }
                    SnapshotValue::References(ids)
                }
            };
            snapshot.insert(association.name().to_string(), captured);
        }
        Ok(snapshot)
    }

    fn related_identifier(
        &self,
        related: &Rc<dyn DocumentSlot>,
        target: &str,
        strict: bool,
    ) -> OdmResult<Option<String>> {
        match self.records.get(&object_key(related)) {
            Some(record) => Ok(Some(record.identifier.clone())),
            None if strict => Err(OdmError::UnmanagedDocument {
                document_type: target.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn ordered_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self
            .records
            .iter()
            .map(|(key, record)| (record.sequence, *key))
            .collect();
        keys.sort_unstable();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    // ---- Flush ----

    /// Write all pending changes in one bulk request.
    ///
    /// Removed documents leave the identity map before the request is sent.
    /// Per-document failures are collected into [`OdmError::FlushAggregate`];
    /// documents that were written stay written.
    pub fn flush(&mut self, persister: &DocumentPersister) -> OdmResult<FlushReport> {
        self.compute_change_sets()?;
        let removals = mem::take(&mut self.scheduled_removals);
        let updates = mem::take(&mut self.scheduled_updates);
        self.scheduled_inserts.clear();

        let mut deletes = Vec::new();
        let mut delete_targets = Vec::new();
        let mut evicted = Vec::new();
        for key in removals {
            let Some(record) = self.records.remove(&key) else {
                continue;
            };
            self.identity_map.remove(&record.identifier);
            match &record.revision {
                Some(rev) => {
                    deletes.push(WireDocument::tombstone(&record.identifier, rev));
                    delete_targets.push(FlushTarget::Delete {
                        identifier: record.identifier.clone(),
                    });
                    evicted.push((key, record));
                }
                None => debug!(id = %record.identifier, "unsaved document evicted"),
            }
        }

        let mut creates = Vec::new();
        let mut writes = Vec::new();
        let mut create_targets = Vec::new();
        let mut write_targets = Vec::new();
        for key in updates {
            let Some(record) = self.records.get(&key) else {
                continue;
            };
            let Some(changeset) = &record.changeset else {
                continue;
            };
            let doc = persister.serialize(
                &record.descriptor,
                &record.identifier,
                record.revision.as_ref(),
                changeset,
            );
            let target = FlushTarget::Write {
                key,
                identifier: record.identifier.clone(),
            };
            if record.revision.is_some() {
                writes.push(doc);
                write_targets.push(target);
            } else {
                creates.push(doc);
                create_targets.push(target);
            }
        }

        if creates.is_empty() && writes.is_empty() && deletes.is_empty() {
            debug!("nothing to flush");
            return Ok(FlushReport::default());
        }

        let outcomes = match persister.bulk_write(creates, writes, deletes) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, "bulk write failed, changes stay pending");
                for target in create_targets.iter().chain(&write_targets) {
                    self.discard_changeset(target);
                }
                self.restore_removals(evicted);
                return Err(e);
            }
        };
        let targets = create_targets
            .into_iter()
            .chain(write_targets)
            .chain(delete_targets);

        let mut report = FlushReport::default();
        let mut failures = Vec::new();
        let mut outcomes: Vec<Option<BulkOutcome>> = outcomes.into_iter().map(Some).collect();
        for (position, target) in targets.enumerate() {
            let outcome = take_outcome(&mut outcomes, position, target.identifier());
            match (target, outcome) {
                (FlushTarget::Write { key, identifier }, Some(BulkOutcome::Written { rev, .. })) => {
                    match self.confirm_write(key, rev) {
                        Ok(()) => report.written += 1,
                        Err(e) => failures.push(DocumentFailure {
                            identifier,
                            error: "local_update".into(),
                            reason: e.to_string(),
                        }),
                    }
                }
                (FlushTarget::Delete { .. }, Some(BulkOutcome::Written { .. })) => {
                    report.deleted += 1;
                }
                (target, Some(BulkOutcome::Failed { error, reason, .. })) => {
                    warn!(id = target.identifier(), %error, %reason, "document rejected by store");
                    self.discard_changeset(&target);
                    failures.push(DocumentFailure {
                        identifier: target.identifier().to_string(),
                        error,
                        reason,
                    });
                }
                (target, None) => {
                    warn!(id = target.identifier(), "no result for document in bulk response");
                    self.discard_changeset(&target);
                    failures.push(DocumentFailure {
                        identifier: target.identifier().to_string(),
                        error: "missing_result".into(),
                        reason: "store returned no result for this document".into(),
                    });
                }
            }
        }

        debug!(
            written = report.written,
            deleted = report.deleted,
            failed = failures.len(),
            "flush complete"
        );
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(OdmError::FlushAggregate { failures })
        }
    }

    fn confirm_write(&mut self, key: ObjectKey, rev: Revision) -> OdmResult<()> {
        let Some(record) = self.records.get_mut(&key) else {
            return Ok(());
        };
        record.revision = Some(rev.clone());
        record.snapshot = record.changeset.take();
        let descriptor = record.descriptor.clone();
        let slot = record.slot.clone();

        descriptor.set_version(&mut *slot.value_mut()?, Some(rev))?;
        let value = slot.value()?;
        for association in descriptor.associations() {
            association.mark_clean(&*value)?;
        }
        Ok(())
    }

    /// Put documents evicted for deletion back when the request never
    /// reached the store.
    fn restore_removals(&mut self, evicted: Vec<(ObjectKey, ManagedRecord)>) {
        for (key, record) in evicted {
            self.identity_map.insert(record.identifier.clone(), key);
            self.records.insert(key, record);
            self.scheduled_removals.push(key);
        }
    }

    fn discard_changeset(&mut self, target: &FlushTarget) {
        if let FlushTarget::Write { key, .. } = target {
            if let Some(record) = self.records.get_mut(key) {
                record.changeset = None;
                // A failed create must be retried by the next flush.
                if record.revision.is_none() {
                    record.snapshot = None;
                }
            }
        }
    }
}

/// The result for `identifier`. Rows normally line up with the request;
/// a row at `position` without an id is taken as that document's.
fn take_outcome(
    outcomes: &mut [Option<BulkOutcome>],
    position: usize,
    identifier: &str,
) -> Option<BulkOutcome> {
    let in_place = outcomes
        .get(position)
        .and_then(Option::as_ref)
        .is_some_and(|row| row.id() == identifier || row.id().is_empty());
    if in_place {
        return outcomes.get_mut(position).and_then(Option::take);
    }
    outcomes
        .iter_mut()
        .find(|row| row.as_ref().is_some_and(|row| row.id() == identifier))
        .and_then(Option::take)
}

/// Write a hydration into an instance and mark it loaded.
fn apply(hydration: &Hydration, slot: &Rc<dyn DocumentSlot>) -> OdmResult<()> {
    let descriptor = &hydration.descriptor;
    {
        let mut value = slot.value_mut()?;
        descriptor.set_identifier(&mut *value, Some(hydration.identifier.clone()))?;
        descriptor.set_version(&mut *value, hydration.revision.clone())?;
        for (index, json) in &hydration.fields {
            if let Some(field) = descriptor.fields().get(*index) {
                field.write(&mut *value, json.clone())?;
            }
        }
        for (index, association) in &hydration.associations {
            if let Some(mapping) = descriptor.associations().get(*index) {
                mapping.write(&mut *value, association.clone())?;
            }
        }
    }
    slot.mark_initialized();
    Ok(())
}

/// Load data into an instance no unit of work tracks anymore.
pub(crate) fn hydrate_detached(hydration: &Hydration, slot: &Rc<dyn DocumentSlot>) -> OdmResult<()> {
    apply(hydration, slot)
}

/// Compares everything except to-many id lists; those dirty their owner
/// only through the collection's change flag.
fn same_fields(snapshot: &Snapshot, current: &Snapshot) -> bool {
    fn compared(captured: &Snapshot) -> impl Iterator<Item = (&String, &SnapshotValue)> {
        captured
            .iter()
            .filter(|(_, value)| !matches!(value, SnapshotValue::References(_)))
    }
    compared(snapshot).eq(compared(current))
}

fn collections_changed(descriptor: &ClassDescriptor, slot: &Rc<dyn DocumentSlot>) -> OdmResult<bool> {
    let value = slot.value()?;
    for association in descriptor.associations() {
        if let Some(AssociationView::Many(view)) = association.read(&*value)? {
            if view.changed {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("managed", &self.identity_map.len())
            .field("scheduled_updates", &self.scheduled_updates.len())
            .field("scheduled_removals", &self.scheduled_removals.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::handle::Handle;
    use crate::mapping::MetadataRegistry;
    use ottoman_client::{InMemoryCouch, Method, Response, Transport, TransportError, TransportResult};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Page {
        id: Option<String>,
        rev: Option<Revision>,
        title: String,
        views: u64,
    }

    /// Passes requests to the in-memory store unless told to misbehave.
    struct Interfering {
        store: Arc<InMemoryCouch>,
        failing_bulk_writes: AtomicUsize,
        reversed_bulk_results: AtomicBool,
        fixed_uuid: Mutex<Option<String>>,
    }

    impl Interfering {
        fn new(store: Arc<InMemoryCouch>) -> Self {
            Self {
                store,
                failing_bulk_writes: AtomicUsize::new(0),
                reversed_bulk_results: AtomicBool::new(false),
                fixed_uuid: Mutex::new(None),
            }
        }
    }

    impl Transport for Interfering {
        fn request(&self, method: Method, path: &str, body: Option<&Value>) -> TransportResult<Response> {
            let bulk = path.ends_with("/_bulk_docs");
            if bulk && self.failing_bulk_writes.load(Ordering::SeqCst) > 0 {
                self.failing_bulk_writes.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Unavailable("connection reset".into()));
            }
            if path.starts_with("/_uuids") {
                if let Some(uuid) = self.fixed_uuid.lock().unwrap().clone() {
                    return Ok(Response::new(200, json!({"uuids": [uuid.clone(), uuid]})));
                }
            }
            let mut resp = self.store.request(method, path, body)?;
            if bulk && self.reversed_bulk_results.load(Ordering::SeqCst) {
                if let Value::Array(rows) = &mut resp.body {
                    rows.reverse();
                }
            }
            Ok(resp)
        }
    }

    struct Fixture {
        store: Arc<InMemoryCouch>,
        faults: Arc<Interfering>,
        persister: DocumentPersister,
        descriptor: Arc<ClassDescriptor>,
        uow: UnitOfWork,
    }

    fn fixture() -> Fixture {
        let registry = MetadataRegistry::new();
        let descriptor = registry
            .register(
                ClassDescriptor::builder_default::<Page>("Page")
                    .identifier("id", |p| &p.id, |p| &mut p.id)
                    .version("rev", |p| &p.rev, |p| &mut p.rev)
                    .field("title", |p| &p.title, |p| &mut p.title)
                    .field("views", |p| &p.views, |p| &mut p.views)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let config = Configuration::default().with_uuid_buffer_size(4);
        let store = Arc::new(InMemoryCouch::new());
        let faults = Arc::new(Interfering::new(store.clone()));
        let client = CouchClient::new(faults.clone());
        client.create_database(&config.database_name()).unwrap();
        Fixture {
            store,
            faults,
            persister: DocumentPersister::new(client, Arc::new(registry), &config),
            descriptor,
            uow: UnitOfWork::new(config.uuid_buffer_size),
        }
    }

    fn page(title: &str) -> Handle<Page> {
        Handle::new(Page {
            title: title.into(),
            ..Default::default()
        })
    }

    fn hydration(descriptor: &Arc<ClassDescriptor>, id: &str, rev: &str, title: &str) -> Hydration {
        Hydration {
            identifier: id.into(),
            revision: Some(Revision::from(rev)),
            descriptor: descriptor.clone(),
            fields: vec![(0, json!(title)), (1, json!(7))],
            associations: Vec::new(),
        }
    }

    fn insert(f: &mut Fixture, handle: &Handle<Page>) -> String {
        f.uow
            .schedule_insert(handle.erased(), f.descriptor.clone(), f.persister.client())
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    #[test]
    fn insert_assigns_uuid_and_registers() {
        let mut f = fixture();
        let handle = page("a");
        let id = insert(&mut f, &handle);

        assert_eq!(handle.read().unwrap().id.as_deref(), Some(id.as_str()));
        assert_eq!(f.uow.state_of(handle.key()), DocumentState::Managed);
        assert_eq!(f.uow.revision_of(handle.key()), Some(None));
        assert!(f.uow.lookup(&id).is_some());
        assert_eq!(f.uow.managed_count(), 1);
    }

    #[test]
    fn second_insert_is_already_managed() {
        let mut f = fixture();
        let handle = page("a");
        insert(&mut f, &handle);
        let err = f
            .uow
            .schedule_insert(handle.erased(), f.descriptor.clone(), f.persister.client())
            .unwrap_err();
        assert!(matches!(err, OdmError::AlreadyManaged { document_type } if document_type == "Page"));
    }

    #[test]
    fn rejected_insert_keeps_caller_identifier() {
        let mut f = fixture();
        *f.faults.fixed_uuid.lock().unwrap() = Some("taken".into());
        let first = page("a");
        assert_eq!(insert(&mut f, &first), "taken");

        let second = page("b");
        let err = f
            .uow
            .schedule_insert(second.erased(), f.descriptor.clone(), f.persister.client())
            .unwrap_err();
        assert!(matches!(err, OdmError::DuplicateIdentifier(id) if id == "taken"));
        assert_eq!(second.read().unwrap().id, None);
        assert_eq!(f.uow.state_of(second.key()), DocumentState::New);
        assert_eq!(f.uow.managed_count(), 1);
    }

    #[test]
    fn attach_rejects_taken_identifier() {
        let mut f = fixture();
        f.uow
            .attach(page("a").erased(), f.descriptor.clone(), "p1".into(), None)
            .unwrap();
        let err = f
            .uow
            .attach(page("b").erased(), f.descriptor.clone(), "p1".into(), None)
            .unwrap_err();
        assert!(matches!(err, OdmError::DuplicateIdentifier(id) if id == "p1"));
    }

    #[test]
    fn attached_documents_are_always_written() {
        let mut f = fixture();
        let handle = page("attached");
        f.uow
            .attach(handle.erased(), f.descriptor.clone(), "p1".into(), None)
            .unwrap();
        assert!(f.uow.has_changes(handle.key()).unwrap());

        let report = f.uow.flush(&f.persister).unwrap();
        assert_eq!(report.written, 1);
        assert!(!f.uow.has_changes(handle.key()).unwrap());
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    #[test]
    fn reconcile_instantiates_once() {
        let mut f = fixture();
        let first = f.uow.reconcile(hydration(&f.descriptor, "p1", "1-a", "t"), None, false).unwrap();
        let second = f.uow.reconcile(hydration(&f.descriptor, "p1", "1-a", "t"), None, false).unwrap();
        assert_eq!(object_key(&first), object_key(&second));

        let handle = Handle::<Page>::from_slot(first).unwrap();
        let page = handle.read().unwrap();
        assert_eq!(page.title, "t");
        assert_eq!(page.views, 7);
        assert_eq!(page.id.as_deref(), Some("p1"));
        assert_eq!(page.rev, Some(Revision::from("1-a")));
    }

    #[test]
    fn reconcile_keeps_local_edits_unless_refreshing() {
        let mut f = fixture();
        let slot = f.uow.reconcile(hydration(&f.descriptor, "p1", "1-a", "stored"), None, false).unwrap();
        let handle = Handle::<Page>::from_slot(slot).unwrap();
        handle.write().unwrap().title = "edited".into();

        f.uow.reconcile(hydration(&f.descriptor, "p1", "2-b", "remote"), None, false).unwrap();
        assert_eq!(handle.read().unwrap().title, "edited");
        assert_eq!(f.uow.revision_of(handle.key()), Some(Some(Revision::from("1-a"))));
        assert!(f.uow.has_changes(handle.key()).unwrap());

        f.uow.reconcile(hydration(&f.descriptor, "p1", "2-b", "remote"), None, true).unwrap();
        assert_eq!(handle.read().unwrap().title, "remote");
        assert_eq!(f.uow.revision_of(handle.key()), Some(Some(Revision::from("2-b"))));
        assert!(!f.uow.has_changes(handle.key()).unwrap());
    }

    #[test]
    fn failed_hydration_registers_nothing() {
        let mut f = fixture();
        let mut broken = hydration(&f.descriptor, "p1", "1-a", "t");
        broken.fields[1] = (1, json!("not a number"));
        assert!(f.uow.reconcile(broken, None, false).is_err());
        assert_eq!(f.uow.managed_count(), 0);
        assert!(f.uow.lookup("p1").is_none());

        f.store.clear_log();
        assert_eq!(f.uow.flush(&f.persister).unwrap(), FlushReport::default());
        assert_eq!(f.store.request_count(), 0);

        let slot = f.uow.reconcile(hydration(&f.descriptor, "p1", "1-a", "t"), None, false).unwrap();
        assert!(!f.uow.has_changes(object_key(&slot)).unwrap());
    }

    #[test]
    fn loaded_documents_start_clean() {
        let mut f = fixture();
        f.uow.reconcile(hydration(&f.descriptor, "p1", "1-a", "t"), None, false).unwrap();
        f.store.clear_log();
        assert_eq!(f.uow.flush(&f.persister).unwrap(), FlushReport::default());
        assert_eq!(f.store.request_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    #[test]
    fn flush_creates_then_updates() {
        let mut f = fixture();
        let handle = page("draft");
        let id = insert(&mut f, &handle);

        let report = f.uow.flush(&f.persister).unwrap();
        assert_eq!(report, FlushReport { written: 1, deleted: 0 });
        let rev1 = handle.read().unwrap().rev.clone().unwrap();
        assert_eq!(rev1.generation(), Some(1));

        handle.write().unwrap().title = "final".into();
        f.uow.flush(&f.persister).unwrap();
        let rev2 = handle.read().unwrap().rev.clone().unwrap();
        assert_eq!(rev2.generation(), Some(2));

        let stored = f.persister.fetch(&id).unwrap().unwrap();
        assert_eq!(stored.get("title"), Some(&json!("final")));
        assert_eq!(stored.revision(), Some(rev2));
        assert!(!stored.contains_key("rev"));
    }

    #[test]
    fn version_field_changes_are_ignored() {
        let mut f = fixture();
        let handle = page("a");
        insert(&mut f, &handle);
        f.uow.flush(&f.persister).unwrap();

        handle.write().unwrap().rev = Some(Revision::from("9-zzz"));
        assert!(!f.uow.has_changes(handle.key()).unwrap());
    }

    #[test]
    fn removal_evicts_and_deletes() {
        let mut f = fixture();
        let handle = page("doomed");
        let id = insert(&mut f, &handle);
        f.uow.flush(&f.persister).unwrap();

        f.uow.schedule_remove(handle.key(), "Page").unwrap();
        assert_eq!(f.uow.state_of(handle.key()), DocumentState::Removed);
        let report = f.uow.flush(&f.persister).unwrap();
        assert_eq!(report, FlushReport { written: 0, deleted: 1 });
        assert!(f.uow.lookup(&id).is_none());
        assert!(f.persister.fetch(&id).unwrap().is_none());
    }

    #[test]
    fn removing_unsaved_document_skips_the_store() {
        let mut f = fixture();
        let handle = page("never saved");
        insert(&mut f, &handle);
        f.uow.schedule_remove(handle.key(), "Page").unwrap();

        f.store.clear_log();
        assert_eq!(f.uow.flush(&f.persister).unwrap(), FlushReport::default());
        assert_eq!(f.store.count_requests(Method::Post, "/ottoman/_bulk_docs"), 0);
        assert_eq!(f.uow.managed_count(), 0);
    }

    #[test]
    fn remove_untracked_is_unmanaged() {
        let mut f = fixture();
        let err = f.uow.schedule_remove(page("x").key(), "Page").unwrap_err();
        assert!(matches!(err, OdmError::UnmanagedDocument { .. }));
    }

    #[test]
    fn conflict_is_reported_without_touching_the_document() {
        let mut f = fixture();
        let handle = page("a");
        let id = insert(&mut f, &handle);
        f.uow.flush(&f.persister).unwrap();
        let rev = handle.read().unwrap().rev.clone().unwrap();

        // Out-of-band update.
        let client = f.persister.client().clone();
        let mut doc = f.persister.fetch(&id).unwrap().unwrap();
        doc.insert("title", json!("theirs"));
        client.put_document("ottoman", &doc).unwrap();

        handle.write().unwrap().title = "ours".into();
        let err = f.uow.flush(&f.persister).unwrap_err();
        assert_eq!(err.failed_identifiers(), vec![id.as_str()]);
        assert_eq!(handle.read().unwrap().rev, Some(rev.clone()));
        assert_eq!(f.uow.revision_of(handle.key()), Some(Some(rev)));

        // Still dirty: the failed write did not move the snapshot.
        assert!(f.uow.has_changes(handle.key()).unwrap());
    }

    #[test]
    fn unreachable_store_keeps_changes_pending() {
        let mut f = fixture();
        let kept = page("kept");
        let kept_id = insert(&mut f, &kept);
        let doomed = page("doomed");
        let doomed_id = insert(&mut f, &doomed);
        f.uow.flush(&f.persister).unwrap();

        let created = page("created");
        let created_id = insert(&mut f, &created);
        kept.write().unwrap().title = "edited".into();
        f.uow.schedule_remove(doomed.key(), "Page").unwrap();

        f.faults.failing_bulk_writes.store(1, Ordering::SeqCst);
        let err = f.uow.flush(&f.persister).unwrap_err();
        assert!(matches!(err, OdmError::Client(_)));
        assert!(err.to_string().contains("connection reset"));

        assert_eq!(f.uow.revision_of(created.key()), Some(None));
        assert!(f.uow.has_changes(created.key()).unwrap());
        assert!(f.uow.has_changes(kept.key()).unwrap());
        assert_eq!(f.uow.state_of(doomed.key()), DocumentState::Removed);
        assert!(f.uow.lookup(&doomed_id).is_some());

        let report = f.uow.flush(&f.persister).unwrap();
        assert_eq!(report, FlushReport { written: 2, deleted: 1 });
        assert!(f.persister.fetch(&created_id).unwrap().is_some());
        assert_eq!(
            f.persister.fetch(&kept_id).unwrap().unwrap().get("title"),
            Some(&json!("edited"))
        );
        assert!(f.persister.fetch(&doomed_id).unwrap().is_none());
        assert!(f.uow.lookup(&doomed_id).is_none());
    }

    #[test]
    fn results_are_matched_by_identifier() {
        let mut f = fixture();
        let first = page("first");
        let first_id = insert(&mut f, &first);
        let second = page("second");
        let second_id = insert(&mut f, &second);

        f.faults.reversed_bulk_results.store(true, Ordering::SeqCst);
        assert_eq!(f.uow.flush(&f.persister).unwrap().written, 2);

        for (handle, id) in [(&first, &first_id), (&second, &second_id)] {
            let stored = f.persister.fetch(id).unwrap().unwrap();
            assert_eq!(handle.read().unwrap().rev, stored.revision());
            assert_eq!(f.uow.revision_of(handle.key()), Some(stored.revision()));
        }
    }

    proptest! {
        #[test]
        fn flushed_documents_are_clean(title in ".{0,40}", views in any::<u64>(), edit in ".{0,40}") {
            let mut f = fixture();
            let handle = Handle::new(Page { title, views, ..Default::default() });
            insert(&mut f, &handle);
            f.uow.flush(&f.persister).unwrap();
            prop_assert!(!f.uow.has_changes(handle.key()).unwrap());

            handle.write().unwrap().title = edit;
            f.uow.flush(&f.persister).unwrap();
            f.uow.compute_change_sets().unwrap();
            prop_assert!(f.uow.scheduled_updates.is_empty());
        }
    }
}
