use std::any::Any;

use ottoman_client::CouchClient;
use tracing::debug;

use crate::error::{OdmError, OdmResult};
use crate::mapping::ClassDescriptor;

/// Produces the identifier of a document being persisted.
pub trait IdGenerator {
    fn generate(
        &mut self,
        document: &mut dyn Any,
        descriptor: &ClassDescriptor,
        client: &CouchClient,
    ) -> OdmResult<String>;
}

/// Uses the identifier the caller already set.
#[derive(Debug, Default)]
pub struct AssignedIdGenerator;

impl IdGenerator for AssignedIdGenerator {
    fn generate(
        &mut self,
        document: &mut dyn Any,
        descriptor: &ClassDescriptor,
        _client: &CouchClient,
    ) -> OdmResult<String> {
        match descriptor.identifier_of(document)? {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(OdmError::MissingIdentifier {
                document_type: descriptor.name().to_string(),
            }),
        }
    }
}

/// Hands out server-issued UUIDs from a buffer refilled in batches.
///
/// Each unit of work owns one; the buffer is never shared.
#[derive(Debug)]
pub struct UuidIdGenerator {
    buffer: Vec<String>,
    batch_size: usize,
}

impl UuidIdGenerator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// UUIDs fetched but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next(&mut self, client: &CouchClient) -> OdmResult<String> {
        if self.buffer.is_empty() {
            self.buffer = client.get_uuids(self.batch_size)?;
            debug!(count = self.buffer.len(), "uuid buffer refilled");
        }
        self.buffer.pop().ok_or_else(|| OdmError::Field {
            field: "_id".into(),
            reason: "store returned no uuids".into(),
        })
    }
}

impl IdGenerator for UuidIdGenerator {
    fn generate(
        &mut self,
        document: &mut dyn Any,
        descriptor: &ClassDescriptor,
        client: &CouchClient,
    ) -> OdmResult<String> {
        let id = self.next(client)?;
        descriptor.set_identifier(document, Some(id.clone()))?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ottoman_client::{InMemoryCouch, Method};
    use std::sync::Arc;

    #[derive(Default)]
    struct Item {
        id: Option<String>,
    }

    fn descriptor() -> ClassDescriptor {
        ClassDescriptor::builder_default::<Item>("Item")
            .identifier("id", |i| &i.id, |i| &mut i.id)
            .build()
            .unwrap()
    }

    fn client() -> (Arc<InMemoryCouch>, CouchClient) {
        let store = Arc::new(InMemoryCouch::new());
        (store.clone(), CouchClient::new(store))
    }

    #[test]
    fn assigned_reads_existing_identifier() {
        let (_, client) = client();
        let mut item = Item {
            id: Some("item-1".into()),
        };
        let id = AssignedIdGenerator
            .generate(&mut item, &descriptor(), &client)
            .unwrap();
        assert_eq!(id, "item-1");
    }

    #[test]
    fn assigned_rejects_missing_or_empty() {
        let (_, client) = client();
        for id in [None, Some(String::new())] {
            let mut item = Item { id };
            let err = AssignedIdGenerator
                .generate(&mut item, &descriptor(), &client)
                .unwrap_err();
            assert!(matches!(err, OdmError::MissingIdentifier { document_type } if document_type == "Item"));
        }
    }

    #[test]
    fn uuid_writes_identifier_into_document() {
        let (_, client) = client();
        let mut generator = UuidIdGenerator::new(3);
        let mut item = Item::default();
        let id = generator.generate(&mut item, &descriptor(), &client).unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(item.id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn uuid_refills_once_per_batch() {
        let (store, client) = client();
        let desc = descriptor();
        let mut generator = UuidIdGenerator::new(3);

        let mut ids = Vec::new();
        for _ in 0..7 {
            let mut item = Item::default();
            ids.push(generator.generate(&mut item, &desc, &client).unwrap());
        }

        assert_eq!(store.count_requests(Method::Get, "/_uuids"), 3);
        assert_eq!(generator.buffered(), 2);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 7);
    }

    #[test]
    fn zero_batch_is_clamped() {
        assert_eq!(UuidIdGenerator::new(0).batch_size, 1);
    }
}
