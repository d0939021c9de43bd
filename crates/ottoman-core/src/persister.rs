//! Translation between mapped documents and their wire form, plus the
//! store calls the unit of work needs.

use std::rc::Rc;
use std::sync::Arc;

use ottoman_client::{BulkOutcome, CouchClient};
use ottoman_types::{Revision, WireDocument};
use serde_json::Value;
use tracing::debug;

use crate::collection::CollectionLoader;
use crate::config::{BulkWriteMode, Configuration};
use crate::error::{OdmError, OdmResult};
use crate::handle::DocumentSlot;
use crate::mapping::{AssociationKind, AssociationValue, ClassDescriptor, MetadataRegistry};
use crate::unit_of_work::{Snapshot, SnapshotValue};

/// Turns related identifiers into in-memory instances during hydration.
pub(crate) trait ReferenceResolver {
    /// The instance for `identifier`: the identity-map entry if there is
    /// one, otherwise a new pending reference.
    fn reference(&self, target: &str, identifier: &str) -> OdmResult<Rc<dyn DocumentSlot>>;

    /// Loader for the members of a pending collection of `target`.
    fn collection_loader(&self, target: &str) -> CollectionLoader;
}

/// A deserialized document, ready to be written into an instance.
pub(crate) struct Hydration {
    pub identifier: String,
    pub revision: Option<Revision>,
    pub descriptor: Arc<ClassDescriptor>,
    /// Field index and value, for keys present in the record.
    pub fields: Vec<(usize, Value)>,
    /// Association index and value, for keys present in the record.
    pub associations: Vec<(usize, AssociationValue)>,
}

impl std::fmt::Debug for Hydration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hydration")
            .field("identifier", &self.identifier)
            .field("revision", &self.revision)
            .field("document_type", &self.descriptor.name())
            .field("fields", &self.fields.len())
            .field("associations", &self.associations.len())
            .finish()
    }
}

/// Reads and writes documents of one database.
pub struct DocumentPersister {
    client: CouchClient,
    registry: Arc<MetadataRegistry>,
    database: String,
    bulk_mode: BulkWriteMode,
    write_type_metadata: bool,
}

impl DocumentPersister {
    pub fn new(client: CouchClient, registry: Arc<MetadataRegistry>, config: &Configuration) -> Self {
        Self {
            client,
            registry,
            database: config.database_name(),
            bulk_mode: config.bulk_mode,
            write_type_metadata: config.write_type_metadata,
        }
    }

    pub fn client(&self) -> &CouchClient {
        &self.client
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Fetch one document. `None` if the store does not have it.
    pub fn fetch(&self, identifier: &str) -> OdmResult<Option<WireDocument>> {
        debug!(db = %self.database, id = identifier, "fetching document");
        Ok(self.client.find_document(&self.database, identifier)?)
    }

    /// Fetch many documents in one request. Missing ids are omitted.
    pub fn fetch_many(&self, identifiers: &[String]) -> OdmResult<Vec<WireDocument>> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.client.all_docs(&self.database, identifiers)?;
        debug!(
            db = %self.database,
            requested = identifiers.len(),
            found = docs.len(),
            "fetched documents"
        );
        Ok(docs)
    }

    /// Build the wire form of a changeset.
    ///
    /// The revision is attached when known; its absence tells the store this
    /// is a create.
    pub fn serialize(
        &self,
        descriptor: &ClassDescriptor,
        identifier: &str,
        revision: Option<&Revision>,
        changeset: &Snapshot,
    ) -> WireDocument {
        let mut doc = WireDocument::new();
        doc.set_id(identifier);
        if let Some(rev) = revision {
            doc.set_revision(rev);
        }

        for field in descriptor.fields() {
            if let Some(SnapshotValue::Field(value)) = changeset.get(field.name()) {
                doc.insert(field.json_key(), value.clone());
            }
        }

        for association in descriptor.associations() {
            match changeset.get(association.name()) {
                Some(SnapshotValue::Reference(id)) => {
                    doc.insert(association.json_key(), id.clone().map_or(Value::Null, Value::String));
                }
                Some(SnapshotValue::References(ids)) => {
                    let ids = ids.iter().cloned().map(Value::String).collect();
                    doc.insert(association.json_key(), Value::Array(ids));
                }
                _ => {}
            }
        }

        if self.write_type_metadata {
            doc.set_type_name(descriptor.name());
        }
        doc
    }

    /// Map a wire record back to field values.
    ///
    /// The type tag selects the descriptor; `expected` is the fallback when
    /// the record carries none. Keys with no mapping are ignored.
    pub(crate) fn deserialize(
        &self,
        wire: WireDocument,
        expected: Option<&Arc<ClassDescriptor>>,
        resolver: &dyn ReferenceResolver,
    ) -> OdmResult<Hydration> {
        let identifier = wire
            .id()
            .map(str::to_string)
            .ok_or_else(|| OdmError::MissingIdentifier {
                document_type: expected.map_or("unknown", |d| d.name()).to_string(),
            })?;

        let descriptor = match (wire.type_name(), expected) {
            (Some(tag), Some(expected)) if tag != expected.name() => {
                return Err(OdmError::TypeMismatch {
                    expected: expected.name().to_string(),
                    found: tag.to_string(),
                })
            }
            (_, Some(expected)) => expected.clone(),
            (Some(tag), None) => self.registry.describe(tag)?,
            (None, None) => return Err(OdmError::MissingTypeMetadata(identifier)),
        };

        let fields = descriptor
            .fields()
            .iter()
            .enumerate()
            .filter_map(|(index, field)| wire.get(field.json_key()).map(|v| (index, v.clone())))
            .collect();

        let mut associations = Vec::new();
        for (index, association) in descriptor.associations().iter().enumerate() {
            let Some(value) = wire.get(association.json_key()) else {
                continue;
            };
            let hydrated = match (association.kind(), value) {
                (AssociationKind::InverseMany, _) => continue,
                (AssociationKind::ReferenceOne, Value::Null) => AssociationValue::One(None),
                (AssociationKind::ReferenceOne, Value::String(id)) => {
                    AssociationValue::One(Some(resolver.reference(association.target(), id)?))
                }
                (AssociationKind::ReferenceMany, Value::Null) => AssociationValue::Many {
                    ids: Vec::new(),
                    loader: resolver.collection_loader(association.target()),
                },
                (AssociationKind::ReferenceMany, Value::Array(items)) => AssociationValue::Many {
                    ids: items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    loader: resolver.collection_loader(association.target()),
                },
                _ => {
                    return Err(OdmError::Field {
                        field: association.name().to_string(),
                        reason: format!("unexpected value {value} in document {identifier}"),
                    })
                }
            };
            associations.push((index, hydrated));
        }

        Ok(Hydration {
            identifier,
            revision: wire.revision(),
            descriptor,
            fields,
            associations,
        })
    }

    /// Submit creates, updates and deletes as one bulk request.
    ///
    /// Outcomes are returned in the same order: creates, then updates, then
    /// deletes.
    pub fn bulk_write(
        &self,
        creates: Vec<WireDocument>,
        updates: Vec<WireDocument>,
        deletes: Vec<WireDocument>,
    ) -> OdmResult<Vec<BulkOutcome>> {
        debug!(
            db = %self.database,
            creates = creates.len(),
            updates = updates.len(),
            deletes = deletes.len(),
            mode = ?self.bulk_mode,
            "submitting bulk write"
        );
        let mut docs = creates;
        docs.extend(updates);
        docs.extend(deletes);
        Ok(self
            .client
            .bulk_docs(&self.database, docs, self.bulk_mode.all_or_nothing())?)
    }
}

impl std::fmt::Debug for DocumentPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentPersister")
            .field("database", &self.database)
            .field("bulk_mode", &self.bulk_mode)
            .field("write_type_metadata", &self.write_type_metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::ReferenceCollection;
    use crate::handle::Handle;
    use ottoman_client::{InMemoryCouch, Method};
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Debug, Default)]
    struct Person {
        id: Option<String>,
        name: String,
    }

    #[derive(Debug, Default)]
    struct Group {
        id: Option<String>,
        title: String,
        owner: Option<Handle<Person>>,
        members: ReferenceCollection<Person>,
    }

    /// Resolver that makes pending references and records what it was asked.
    struct RecordingResolver {
        registry: Arc<MetadataRegistry>,
        requested: RefCell<Vec<String>>,
    }

    impl ReferenceResolver for RecordingResolver {
        fn reference(&self, target: &str, identifier: &str) -> OdmResult<Rc<dyn DocumentSlot>> {
            self.requested.borrow_mut().push(identifier.to_string());
            let descriptor = self.registry.describe(target)?;
            Ok(descriptor.instantiate_pending(identifier.to_string(), Rc::new(|_: &Rc<dyn DocumentSlot>| -> OdmResult<()> { Ok(()) })))
        }

        fn collection_loader(&self, _target: &str) -> CollectionLoader {
            Rc::new(|_: &[String]| -> OdmResult<Vec<Rc<dyn DocumentSlot>>> { Ok(Vec::new()) })
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        let registry = MetadataRegistry::new();
        registry
            .register(
                ClassDescriptor::builder_default::<Person>("Person")
                    .identifier("id", |p| &p.id, |p| &mut p.id)
                    .field("name", |p| &p.name, |p| &mut p.name)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ClassDescriptor::builder_default::<Group>("Group")
                    .identifier("id", |g| &g.id, |g| &mut g.id)
                    .field_with_key("title", "group_title", |g| &g.title, |g| &mut g.title)
                    .reference_one::<Person>("owner", "Person", |g| &g.owner, |g| &mut g.owner)
                    .reference_many::<Person>("members", "Person", |g| &g.members, |g| &mut g.members)
                    .inverse_many("followers", "Person")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn persister(config: &Configuration) -> (Arc<InMemoryCouch>, DocumentPersister) {
        let store = Arc::new(InMemoryCouch::new());
        let client = CouchClient::new(store.clone());
        client.create_database(&config.database_name()).unwrap();
        (store, DocumentPersister::new(client, registry(), config))
    }

    fn resolver(persister: &DocumentPersister) -> RecordingResolver {
        RecordingResolver {
            registry: persister.registry.clone(),
            requested: RefCell::new(Vec::new()),
        }
    }

    fn group_changeset() -> Snapshot {
        let mut changeset = Snapshot::new();
        changeset.insert("title".into(), SnapshotValue::Field(json!("admins")));
        changeset.insert("owner".into(), SnapshotValue::Reference(Some("p1".into())));
        changeset.insert(
            "members".into(),
            SnapshotValue::References(vec!["p1".into(), "p2".into()]),
        );
        changeset
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    #[test]
    fn serialize_maps_fields_and_associations() {
        let (_, persister) = persister(&Configuration::default());
        let desc = persister.registry.describe("Group").unwrap();
        let rev = Revision::from("3-abc");
        let doc = persister.serialize(&desc, "g1", Some(&rev), &group_changeset());

        assert_eq!(doc.id(), Some("g1"));
        assert_eq!(doc.revision(), Some(rev));
        assert_eq!(doc.get("group_title"), Some(&json!("admins")));
        assert_eq!(doc.get("owner"), Some(&json!("p1")));
        assert_eq!(doc.get("members"), Some(&json!(["p1", "p2"])));
        assert_eq!(doc.type_name(), Some("Group"));
        assert!(!doc.contains_key("followers"));
        assert!(!doc.contains_key("title"));
    }

    #[test]
    fn serialize_null_reference_and_no_revision() {
        let (_, persister) = persister(&Configuration::default());
        let desc = persister.registry.describe("Group").unwrap();
        let mut changeset = Snapshot::new();
        changeset.insert("owner".into(), SnapshotValue::Reference(None));
        let doc = persister.serialize(&desc, "g1", None, &changeset);
        assert_eq!(doc.get("owner"), Some(&Value::Null));
        assert_eq!(doc.revision(), None);
    }

    #[test]
    fn type_tag_can_be_disabled() {
        let (_, persister) = persister(&Configuration::default().with_type_metadata(false));
        let desc = persister.registry.describe("Person").unwrap();
        let doc = persister.serialize(&desc, "p1", None, &Snapshot::new());
        assert_eq!(doc.type_name(), None);
    }

    // -----------------------------------------------------------------------
    // Deserialization
    // -----------------------------------------------------------------------

    #[test]
    fn deserialize_resolves_descriptor_from_tag() {
        let (_, persister) = persister(&Configuration::default());
        let wire = WireDocument::from_value(json!({
            "_id": "g1",
            "_rev": "1-aa",
            "group_title": "admins",
            "owner": "p1",
            "members": ["p1", "p2"],
            "followers": ["p9"],
            "unmapped": true,
            "odm_metadata": {"type": "Group"},
        }))
        .unwrap();

        let resolver = resolver(&persister);
        let hydration = persister.deserialize(wire, None, &resolver).unwrap();
        assert_eq!(hydration.identifier, "g1");
        assert_eq!(hydration.revision, Some(Revision::from("1-aa")));
        assert_eq!(hydration.descriptor.name(), "Group");
        assert_eq!(hydration.fields, vec![(0, json!("admins"))]);
        assert_eq!(hydration.associations.len(), 2);
        assert_eq!(*resolver.requested.borrow(), vec!["p1"]);

        match &hydration.associations[1].1 {
            AssociationValue::Many { ids, .. } => assert_eq!(ids, &vec!["p1".to_string(), "p2".to_string()]),
            AssociationValue::One(_) => panic!("expected to-many"),
        }
    }

    #[test]
    fn deserialize_falls_back_to_expected_type() {
        let (_, persister) = persister(&Configuration::default());
        let expected = persister.registry.describe("Person").unwrap();
        let wire = WireDocument::from_value(json!({"_id": "p1", "name": "Ann"})).unwrap();
        let hydration = persister
            .deserialize(wire, Some(&expected), &resolver(&persister))
            .unwrap();
        assert_eq!(hydration.descriptor.name(), "Person");
        assert!(hydration.revision.is_none());
    }

    #[test]
    fn deserialize_rejects_tag_mismatch() {
        let (_, persister) = persister(&Configuration::default());
        let expected = persister.registry.describe("Person").unwrap();
        let wire = WireDocument::from_value(json!({
            "_id": "g1",
            "odm_metadata": {"type": "Group"},
        }))
        .unwrap();
        let err = persister
            .deserialize(wire, Some(&expected), &resolver(&persister))
            .unwrap_err();
        assert!(matches!(err, OdmError::TypeMismatch { expected, found } if expected == "Person" && found == "Group"));
    }

    #[test]
    fn deserialize_without_any_type_fails() {
        let (_, persister) = persister(&Configuration::default());
        let wire = WireDocument::from_value(json!({"_id": "x"})).unwrap();
        assert!(matches!(
            persister.deserialize(wire, None, &resolver(&persister)),
            Err(OdmError::MissingTypeMetadata(id)) if id == "x"
        ));
    }

    #[test]
    fn deserialize_rejects_malformed_reference() {
        let (_, persister) = persister(&Configuration::default());
        let wire = WireDocument::from_value(json!({
            "_id": "g1",
            "owner": 42,
            "odm_metadata": {"type": "Group"},
        }))
        .unwrap();
        assert!(matches!(
            persister.deserialize(wire, None, &resolver(&persister)),
            Err(OdmError::Field { field, .. }) if field == "owner"
        ));
    }

    // -----------------------------------------------------------------------
    // Store access
    // -----------------------------------------------------------------------

    #[test]
    fn fetch_and_fetch_many() {
        let (store, persister) = persister(&Configuration::default());
        let desc = persister.registry.describe("Person").unwrap();
        let docs = vec![
            persister.serialize(&desc, "a", None, &Snapshot::new()),
            persister.serialize(&desc, "b", None, &Snapshot::new()),
        ];
        let outcomes = persister.bulk_write(docs, Vec::new(), Vec::new()).unwrap();
        assert!(outcomes.iter().all(BulkOutcome::is_success));

        assert!(persister.fetch("a").unwrap().is_some());
        assert!(persister.fetch("zz").unwrap().is_none());

        store.clear_log();
        let found = persister
            .fetch_many(&["a".into(), "zz".into(), "b".into()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(store.request_count(), 1);

        assert!(persister.fetch_many(&[]).unwrap().is_empty());
        assert_eq!(store.request_count(), 1);
    }

    #[test]
    fn bulk_write_orders_creates_updates_deletes() {
        let (store, persister) = persister(&Configuration::default());
        let desc = persister.registry.describe("Person").unwrap();
        let first = persister
            .bulk_write(
                vec![
                    persister.serialize(&desc, "u", None, &Snapshot::new()),
                    persister.serialize(&desc, "d", None, &Snapshot::new()),
                ],
                Vec::new(),
                Vec::new(),
            )
            .unwrap();
        let rev_u = first[0].revision().unwrap().clone();
        let rev_d = first[1].revision().unwrap().clone();

        store.clear_log();
        let outcomes = persister
            .bulk_write(
                vec![persister.serialize(&desc, "c", None, &Snapshot::new())],
                vec![persister.serialize(&desc, "u", Some(&rev_u), &Snapshot::new())],
                vec![WireDocument::tombstone("d", &rev_d)],
            )
            .unwrap();
        let ids: Vec<_> = outcomes.iter().map(BulkOutcome::id).collect();
        assert_eq!(ids, vec!["c", "u", "d"]);
        assert!(outcomes.iter().all(BulkOutcome::is_success));
        assert_eq!(store.count_requests(Method::Post, "/ottoman/_bulk_docs"), 1);
        assert!(persister.fetch("d").unwrap().is_none());
    }
}
