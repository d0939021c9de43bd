//! The stored representation of a document.
//!
//! A [`WireDocument`] is a JSON object. A handful of keys are reserved by the
//! store (`_id`, `_rev`, `_deleted`) and one by the mapper
//! (`odm_metadata`, carrying the type discriminator used for polymorphic
//! reads). Everything else belongs to the mapped fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::revision::Revision;

/// Key carrying the document identifier.
pub const ID_KEY: &str = "_id";
/// Key carrying the revision token.
pub const REV_KEY: &str = "_rev";
/// Key marking a deletion inside a bulk request.
pub const DELETED_KEY: &str = "_deleted";
/// Key carrying mapper metadata (`{"type": "<name>"}`).
pub const TYPE_METADATA_KEY: &str = "odm_metadata";

const TYPE_NAME_KEY: &str = "type";

/// A document as exchanged with the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireDocument(Map<String, Value>);

impl WireDocument {
    /// An empty document.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value. Only objects are documents.
    pub fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(TypeError::NotAnObject(json_kind(&other).to_string())),
        }
    }

    /// A deletion marker for `id` at `rev`, as sent in bulk requests.
    pub fn tombstone(id: &str, rev: &Revision) -> Self {
        let mut doc = Self::new();
        doc.set_id(id);
        doc.set_revision(rev);
        doc.mark_deleted();
        doc
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_KEY).and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: &str) {
        self.0.insert(ID_KEY.into(), Value::String(id.to_string()));
    }

    pub fn revision(&self) -> Option<Revision> {
        self.0
            .get(REV_KEY)
            .and_then(Value::as_str)
            .map(Revision::from)
    }

    pub fn set_revision(&mut self, rev: &Revision) {
        self.0
            .insert(REV_KEY.into(), Value::String(rev.as_str().to_string()));
    }

    /// The type discriminator written by the mapper, if any.
    pub fn type_name(&self) -> Option<&str> {
        self.0
            .get(TYPE_METADATA_KEY)
            .and_then(|meta| meta.get(TYPE_NAME_KEY))
            .and_then(Value::as_str)
    }

    pub fn set_type_name(&mut self, name: &str) {
        let meta = self
            .0
            .entry(TYPE_METADATA_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert(TYPE_NAME_KEY.into(), Value::String(name.to_string()));
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.0
            .get(DELETED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_deleted(&mut self) {
        self.0.insert(DELETED_KEY.into(), Value::Bool(true));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Entries that are neither store-reserved nor mapper metadata.
    pub fn user_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter().filter(|(k, _)| !is_reserved(k))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for WireDocument {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for WireDocument {
    type Error = TypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

/// Whether `key` is reserved by the store or the mapper.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with('_') || key == TYPE_METADATA_KEY
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_rejects_non_objects() {
        assert_eq!(
            WireDocument::from_value(json!([1, 2])),
            Err(TypeError::NotAnObject("array".into()))
        );
        assert!(WireDocument::from_value(json!({})).is_ok());
    }

    #[test]
    fn reserved_accessors() {
        let mut doc = WireDocument::from_value(json!({
            "_id": "doc-1",
            "_rev": "3-abc",
            "title": "foo",
        }))
        .unwrap();
        assert_eq!(doc.id(), Some("doc-1"));
        assert_eq!(doc.revision(), Some(Revision::from("3-abc")));
        assert!(!doc.is_deleted());

        doc.set_revision(&Revision::from("4-def"));
        assert_eq!(doc.revision().unwrap().generation(), Some(4));
    }

    #[test]
    fn type_name_round_trip() {
        let mut doc = WireDocument::new();
        assert_eq!(doc.type_name(), None);
        doc.set_type_name("Article");
        assert_eq!(doc.type_name(), Some("Article"));
        assert_eq!(
            doc.get(TYPE_METADATA_KEY),
            Some(&json!({"type": "Article"}))
        );
    }

    #[test]
    fn set_type_name_replaces_malformed_metadata() {
        let mut doc = WireDocument::from_value(json!({"odm_metadata": "junk"})).unwrap();
        doc.set_type_name("User");
        assert_eq!(doc.type_name(), Some("User"));
    }

    #[test]
    fn tombstone_shape() {
        let doc = WireDocument::tombstone("gone", &Revision::from("1-x"));
        assert_eq!(
            doc.into_value(),
            json!({"_id": "gone", "_rev": "1-x", "_deleted": true})
        );
    }

    #[test]
    fn user_fields_skip_reserved_keys() {
        let mut doc = WireDocument::new();
        doc.set_id("a");
        doc.set_type_name("T");
        doc.insert("name", json!("n"));
        let keys: Vec<&String> = doc.user_fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["name"]);
    }
}
