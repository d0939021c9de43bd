use std::fmt;
use std::sync::Arc;

use ottoman_types::{Revision, WireDocument};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bulk::{BulkOutcome, BulkRequest};
use crate::endpoint;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::transport::{Method, Response, Transport};

/// Summary returned by `GET /<db>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub update_seq: u64,
}

/// Acknowledgement of a single-document write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub id: String,
    pub rev: Revision,
}

/// Typed client for the CouchDB document protocol.
///
/// Cloning is cheap; clones share the transport.
#[derive(Clone)]
pub struct CouchClient {
    transport: Arc<dyn Transport>,
}

impl CouchClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // ---- Server ----

    /// The store's version string.
    pub fn version(&self) -> ClientResult<String> {
        let resp = self.expect(Method::Get, endpoint::ROOT, None)?;
        resp.body
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed(endpoint::ROOT, "missing version"))
    }

    pub fn all_databases(&self) -> ClientResult<Vec<String>> {
        let resp = self.expect(Method::Get, endpoint::ALL_DBS, None)?;
        decode(endpoint::ALL_DBS, resp.body)
    }

    /// Fetch `count` server-issued UUIDs in one round trip.
    pub fn get_uuids(&self, count: usize) -> ClientResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let path = endpoint::uuids(count);
        let resp = self.expect(Method::Get, &path, None)?;
        let uuids = resp
            .body
            .get("uuids")
            .cloned()
            .ok_or_else(|| malformed(&path, "missing uuids"))?;
        decode(&path, uuids)
    }

    // ---- Databases ----

    /// Create a database. An existing database is an HTTP 412 error.
    pub fn create_database(&self, name: &str) -> ClientResult<()> {
        self.expect(Method::Put, &endpoint::database(name), None)?;
        Ok(())
    }

    /// Drop a database. Returns `false` if it did not exist.
    pub fn delete_database(&self, name: &str) -> ClientResult<bool> {
        let path = endpoint::database(name);
        let resp = self.call(Method::Delete, &path, None)?;
        match resp.status {
            404 => Ok(false),
            _ if resp.is_success() => Ok(true),
            _ => Err(http_error(&path, &resp)),
        }
    }

    pub fn database_info(&self, name: &str) -> ClientResult<DatabaseInfo> {
        let path = endpoint::database(name);
        let resp = self.expect(Method::Get, &path, None)?;
        decode(&path, resp.body)
    }

    // ---- Documents ----

    /// Read one document. `None` when the store answers 404.
    pub fn find_document(&self, db: &str, id: &str) -> ClientResult<Option<WireDocument>> {
        let path = endpoint::document(db, id);
        let resp = self.call(Method::Get, &path, None)?;
        if resp.status == 404 {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(http_error(&path, &resp));
        }
        Ok(Some(WireDocument::from_value(resp.body)?))
    }

    /// Read many documents in one request.
    ///
    /// Only documents the store holds are returned; unknown and deleted ids
    /// are dropped, so the result may be shorter than `ids`.
    pub fn all_docs(&self, db: &str, ids: &[String]) -> ClientResult<Vec<WireDocument>> {
        let path = endpoint::all_docs(db);
        let resp = self.expect(Method::Post, &path, Some(&json!({ "keys": ids })))?;
        let rows = resp
            .body
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed(&path, "missing rows"))?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            match row.get("doc") {
                Some(doc) if doc.is_object() => docs.push(WireDocument::from_value(doc.clone())?),
                _ => debug!(key = ?row.get("key"), "bulk read row without document"),
            }
        }
        Ok(docs)
    }

    /// Write a document at its `_id`. Updates must carry the current `_rev`.
    pub fn put_document(&self, db: &str, doc: &WireDocument) -> ClientResult<WriteResponse> {
        let id = doc.id().ok_or(ClientError::MissingDocumentId)?;
        let path = endpoint::document(db, id);
        let body = doc.clone().into_value();
        let resp = self.expect(Method::Put, &path, Some(&body))?;
        decode(&path, resp.body)
    }

    /// Create a document, letting the store pick the id if none is set.
    pub fn post_document(&self, db: &str, doc: &WireDocument) -> ClientResult<WriteResponse> {
        let path = endpoint::database(db);
        let body = doc.clone().into_value();
        let resp = self.expect(Method::Post, &path, Some(&body))?;
        decode(&path, resp.body)
    }

    pub fn delete_document(&self, db: &str, id: &str, rev: &Revision) -> ClientResult<WriteResponse> {
        let path = endpoint::document_rev(db, id, rev.as_str());
        let resp = self.expect(Method::Delete, &path, None)?;
        decode(&path, resp.body)
    }

    /// Submit a batch of writes in one request.
    ///
    /// The outcome list is parallel to `docs`. Per-document failures
    /// (conflicts, rejections) are outcomes, not errors. A row that does not
    /// decode becomes a `malformed_result` failure for that row only.
    pub fn bulk_docs(
        &self,
        db: &str,
        docs: Vec<WireDocument>,
        all_or_nothing: bool,
    ) -> ClientResult<Vec<BulkOutcome>> {
        let path = endpoint::bulk_docs(db);
        let count = docs.len();
        let body = serde_json::to_value(BulkRequest::new(docs, all_or_nothing))
            .map_err(|e| malformed(&path, &e.to_string()))?;
        let resp = self.expect(Method::Post, &path, Some(&body))?;
        let Value::Array(rows) = resp.body else {
            return Err(malformed(&path, "expected an array of results"));
        };
        let outcomes: Vec<BulkOutcome> = rows.into_iter().map(bulk_row).collect();
        debug!(
            submitted = count,
            failed = outcomes.iter().filter(|o| !o.is_success()).count(),
            "bulk write complete"
        );
        Ok(outcomes)
    }

    // ---- Plumbing ----

    fn call(&self, method: Method, path: &str, body: Option<&Value>) -> ClientResult<Response> {
        let resp = self.transport.request(method, path, body)?;
        debug!(%method, path, status = resp.status, "store request");
        Ok(resp)
    }

    fn expect(&self, method: Method, path: &str, body: Option<&Value>) -> ClientResult<Response> {
        let resp = self.call(method, path, body)?;
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(http_error(path, &resp))
        }
    }
}

impl fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouchClient").finish_non_exhaustive()
    }
}

fn http_error(path: &str, resp: &Response) -> ClientError {
    ClientError::Http {
        status: resp.status,
        path: path.to_string(),
        error: resp.error_name().to_string(),
        reason: resp.reason().to_string(),
    }
}

fn malformed(path: &str, detail: &str) -> ClientError {
    ClientError::Transport(TransportError::MalformedResponse(format!("{path}: {detail}")))
}

fn bulk_row(row: Value) -> BulkOutcome {
    let id = row
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(row).unwrap_or_else(|e| {
        warn!(id = %id, error = %e, "malformed bulk result row");
        BulkOutcome::Failed {
            id,
            error: "malformed_result".into(),
            reason: e.to_string(),
        }
    })
}

fn decode<T: DeserializeOwned>(path: &str, body: Value) -> ClientResult<T> {
    serde_json::from_value(body).map_err(|e| malformed(path, &e.to_string()))
}
