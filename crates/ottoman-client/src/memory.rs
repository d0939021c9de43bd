//! In-process store emulator.
//!
//! [`InMemoryCouch`] answers the subset of the CouchDB HTTP protocol the
//! client speaks, with the same status codes, error names and revision
//! rules. Every request is logged so tests can count round trips.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use ottoman_types::{Revision, DELETED_KEY, ID_KEY, REV_KEY};
use serde_json::{json, Map, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::bulk::BulkRequest;
use crate::endpoint::decode_segment;
use crate::error::{TransportError, TransportResult};
use crate::transport::{Method, Response, Transport};

const VERSION: &str = "1.0.1";

#[derive(Clone, Debug)]
struct StoredDocument {
    rev: Revision,
    body: Map<String, Value>,
    deleted: bool,
}

impl StoredDocument {
    fn to_value(&self, id: &str) -> Value {
        let mut out = self.body.clone();
        out.insert(ID_KEY.into(), Value::String(id.to_string()));
        out.insert(REV_KEY.into(), Value::String(self.rev.to_string()));
        Value::Object(out)
    }
}

#[derive(Clone, Debug, Default)]
struct Database {
    docs: BTreeMap<String, StoredDocument>,
    update_seq: u64,
}

impl Database {
    fn live(&self, id: &str) -> Option<&StoredDocument> {
        self.docs.get(id).filter(|doc| !doc.deleted)
    }

    fn doc_count(&self) -> usize {
        self.docs.values().filter(|doc| !doc.deleted).count()
    }

    /// Apply one document write, enforcing the revision rules.
    fn write(&mut self, id: &str, mut body: Map<String, Value>) -> Result<Revision, Rejection> {
        let supplied = body.remove(REV_KEY).and_then(|v| v.as_str().map(str::to_string));
        let delete = body
            .remove(DELETED_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        body.remove(ID_KEY);

        let previous = match (self.docs.get(id), supplied.as_deref()) {
            (Some(doc), Some(rev)) if doc.rev.as_str() == rev => Some(doc.rev.clone()),
            (Some(doc), None) if doc.deleted => Some(doc.rev.clone()),
            (Some(_), _) => return Err(Rejection::conflict()),
            (None, Some(_)) => return Err(Rejection::conflict()),
            (None, None) => None,
        };
        if delete && self.live(id).is_none() {
            return Err(Rejection::not_found("missing"));
        }

        let rev = next_revision(previous.as_ref(), &body);
        if delete {
            body.clear();
        }
        self.update_seq += 1;
        self.docs.insert(
            id.to_string(),
            StoredDocument {
                rev: rev.clone(),
                body,
                deleted: delete,
            },
        );
        Ok(rev)
    }
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, Database>,
}

/// A refused request or document write.
#[derive(Clone, Copy, Debug)]
struct Rejection {
    status: u16,
    error: &'static str,
    reason: &'static str,
}

impl Rejection {
    fn conflict() -> Self {
        Self {
            status: 409,
            error: "conflict",
            reason: "Document update conflict.",
        }
    }

    fn not_found(reason: &'static str) -> Self {
        Self {
            status: 404,
            error: "not_found",
            reason,
        }
    }

    fn no_db() -> Self {
        Self {
            status: 404,
            error: "not_found",
            reason: "no_db_file",
        }
    }

    fn bad_request(reason: &'static str) -> Self {
        Self {
            status: 400,
            error: "bad_request",
            reason,
        }
    }

    fn into_response(self) -> Response {
        Response::new(self.status, json!({"error": self.error, "reason": self.reason}))
    }
}

/// A logged request line.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LoggedRequest {
    method: Method,
    path: String,
}

/// In-memory store speaking the CouchDB document protocol.
///
/// Thread-safe; state lives behind a `RwLock`. Every request, successful or
/// not, is appended to a request log.
#[derive(Debug, Default)]
pub struct InMemoryCouch {
    state: RwLock<ServerState>,
    log: Mutex<Vec<LoggedRequest>>,
}

impl InMemoryCouch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total requests received since creation or the last [`clear_log`](Self::clear_log).
    pub fn request_count(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Requests with this method whose path (query string excluded) equals `path`.
    pub fn count_requests(&self, method: Method, path: &str) -> usize {
        self.log
            .lock()
            .map(|log| {
                log.iter()
                    .filter(|r| r.method == method && r.path == path)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn clear_log(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    fn record(&self, method: Method, path: &str) -> TransportResult<()> {
        let mut log = self.log.lock().map_err(|_| poisoned())?;
        log.push(LoggedRequest {
            method,
            path: path.to_string(),
        });
        Ok(())
    }

    fn route(
        &self,
        method: Method,
        segments: &[String],
        query: &BTreeMap<String, String>,
        body: Option<&Value>,
    ) -> TransportResult<Response> {
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let outcome = match (method, segments.as_slice()) {
            (Method::Get, []) => Ok(Response::new(
                200,
                json!({"couchdb": "Welcome", "version": VERSION}),
            )),
            (Method::Get, ["_all_dbs"]) => {
                let state = self.state.read().map_err(|_| poisoned())?;
                let names: Vec<&String> = state.databases.keys().collect();
                Ok(Response::new(200, json!(names)))
            }
            (Method::Get, ["_uuids"]) => {
                let count = query
                    .get("count")
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(1);
                let uuids: Vec<String> = (0..count).map(|_| new_uuid()).collect();
                Ok(Response::new(200, json!({ "uuids": uuids })))
            }
            (Method::Put, [db]) => self.create_database(db)?,
            (Method::Delete, [db]) => self.delete_database(db)?,
            (Method::Get, [db]) => self.database_info(db)?,
            (Method::Post, [db]) => self.post_document(db, body)?,
            (Method::Post, [db, "_bulk_docs"]) => self.bulk_docs(db, body)?,
            (Method::Post, [db, "_all_docs"]) => self.all_docs(db, body)?,
            (Method::Get, [db, "_all_docs"]) => self.all_docs(db, None)?,
            (Method::Get, [db, id]) => self.get_document(db, id)?,
            (Method::Put, [db, id]) => self.put_document(db, id, body)?,
            (Method::Delete, [db, id]) => self.delete_document(db, id, query.get("rev"))?,
            _ => Err(Rejection::bad_request("unsupported request")),
        };
        Ok(outcome.unwrap_or_else(Rejection::into_response))
    }

    // ---- Databases ----

    fn create_database(&self, db: &str) -> TransportResult<Result<Response, Rejection>> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.databases.contains_key(db) {
            return Ok(Err(Rejection {
                status: 412,
                error: "file_exists",
                reason: "The database could not be created, the file already exists.",
            }));
        }
        state.databases.insert(db.to_string(), Database::default());
        debug!(db, "database created");
        Ok(Ok(Response::new(201, json!({"ok": true}))))
    }

    fn delete_database(&self, db: &str) -> TransportResult<Result<Response, Rejection>> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        Ok(match state.databases.remove(db) {
            Some(_) => {
                debug!(db, "database dropped");
                Ok(Response::new(200, json!({"ok": true})))
            }
            None => Err(Rejection::no_db()),
        })
    }

    fn database_info(&self, db: &str) -> TransportResult<Result<Response, Rejection>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.databases.get(db).ok_or_else(Rejection::no_db).map(|database| {
            Response::new(
                200,
                json!({
                    "db_name": db,
                    "doc_count": database.doc_count(),
                    "update_seq": database.update_seq,
                }),
            )
        }))
    }

    // ---- Documents ----

    fn get_document(&self, db: &str, id: &str) -> TransportResult<Result<Response, Rejection>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let Some(database) = state.databases.get(db) else {
            return Ok(Err(Rejection::no_db()));
        };
        Ok(match database.docs.get(id) {
            Some(doc) if doc.deleted => Err(Rejection::not_found("deleted")),
            Some(doc) => Ok(Response::new(200, doc.to_value(id))),
            None => Err(Rejection::not_found("missing")),
        })
    }

    fn put_document(
        &self,
        db: &str,
        id: &str,
        body: Option<&Value>,
    ) -> TransportResult<Result<Response, Rejection>> {
        let Some(body) = body.and_then(Value::as_object) else {
            return Ok(Err(Rejection::bad_request("Document must be a JSON object")));
        };
        self.write_one(db, id, body.clone())
    }

    fn post_document(&self, db: &str, body: Option<&Value>) -> TransportResult<Result<Response, Rejection>> {
        let Some(body) = body.and_then(Value::as_object) else {
            return Ok(Err(Rejection::bad_request("Document must be a JSON object")));
        };
        let id = body
            .get(ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_uuid);
        self.write_one(db, &id, body.clone())
    }

    fn delete_document(
        &self,
        db: &str,
        id: &str,
        rev: Option<&String>,
    ) -> TransportResult<Result<Response, Rejection>> {
        let mut body = Map::new();
        if let Some(rev) = rev {
            body.insert(REV_KEY.into(), Value::String(rev.clone()));
        }
        body.insert(DELETED_KEY.into(), Value::Bool(true));
        self.write_one(db, id, body)
    }

    fn write_one(
        &self,
        db: &str,
        id: &str,
        body: Map<String, Value>,
    ) -> TransportResult<Result<Response, Rejection>> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let Some(database) = state.databases.get_mut(db) else {
            return Ok(Err(Rejection::no_db()));
        };
        Ok(database
            .write(id, body)
            .map(|rev| Response::new(201, json!({"ok": true, "id": id, "rev": rev}))))
    }

    // ---- Bulk ----

    fn all_docs(&self, db: &str, body: Option<&Value>) -> TransportResult<Result<Response, Rejection>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let Some(database) = state.databases.get(db) else {
            return Ok(Err(Rejection::no_db()));
        };

        let rows: Vec<Value> = match body.and_then(|b| b.get("keys")).and_then(Value::as_array) {
            Some(keys) => keys
                .iter()
                .filter_map(Value::as_str)
                .map(|key| match database.docs.get(key) {
                    Some(doc) if doc.deleted => json!({
                        "id": key,
                        "key": key,
                        "value": {"rev": doc.rev, "deleted": true},
                        "doc": null,
                    }),
                    Some(doc) => json!({
                        "id": key,
                        "key": key,
                        "value": {"rev": doc.rev},
                        "doc": doc.to_value(key),
                    }),
                    None => json!({"key": key, "error": "not_found"}),
                })
                .collect(),
            None => database
                .docs
                .iter()
                .filter(|(_, doc)| !doc.deleted)
                .map(|(id, doc)| {
                    json!({
                        "id": id,
                        "key": id,
                        "value": {"rev": doc.rev},
                        "doc": doc.to_value(id),
                    })
                })
                .collect(),
        };

        Ok(Ok(Response::new(
            200,
            json!({"total_rows": database.doc_count(), "offset": 0, "rows": rows}),
        )))
    }

    fn bulk_docs(&self, db: &str, body: Option<&Value>) -> TransportResult<Result<Response, Rejection>> {
        let request: BulkRequest = match body.cloned().map(serde_json::from_value) {
            Some(Ok(request)) => request,
            _ => return Ok(Err(Rejection::bad_request("Malformed bulk request"))),
        };

        let mut state = self.state.write().map_err(|_| poisoned())?;
        let Some(database) = state.databases.get_mut(db) else {
            return Ok(Err(Rejection::no_db()));
        };

        // Strict batches are staged on a copy and only committed if every
        // document went through.
        let mut staged = if request.all_or_nothing {
            None
        } else {
            Some(database.clone())
        };
        let target = staged.as_mut().unwrap_or(&mut *database);

        let mut results = Vec::with_capacity(request.docs.len());
        for doc in request.docs {
            let id = doc.id().map(str::to_string).unwrap_or_else(new_uuid);
            let result = target.write(&id, doc.into_map());
            results.push((id, result));
        }

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        let outcomes: Vec<Value> = match staged {
            Some(staged) if failed == 0 => {
                *database = staged;
                results.iter().map(|(id, r)| written_or_failed(id, r)).collect()
            }
            Some(_) => results
                .iter()
                .map(|(id, r)| match r {
                    Ok(_) => json!({
                        "id": id,
                        "error": "aborted",
                        "reason": "Batch rejected because another document conflicted.",
                    }),
                    Err(_) => written_or_failed(id, r),
                })
                .collect(),
            None => results.iter().map(|(id, r)| written_or_failed(id, r)).collect(),
        };

        debug!(db, docs = outcomes.len(), failed, "bulk write applied");
        Ok(Ok(Response::new(201, Value::Array(outcomes))))
    }
}

impl Transport for InMemoryCouch {
    fn request(&self, method: Method, path: &str, body: Option<&Value>) -> TransportResult<Response> {
        let (path_part, query_part) = path.split_once('?').unwrap_or((path, ""));
        self.record(method, path_part)?;
        trace!(%method, path, "emulated request");

        let segments: Vec<String> = path_part
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode_segment)
            .collect();
        let query: BTreeMap<String, String> = query_part
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_segment(key), decode_segment(value))
            })
            .collect();

        self.route(method, &segments, &query, body)
    }
}

fn written_or_failed(id: &str, result: &Result<Revision, Rejection>) -> Value {
    match result {
        Ok(rev) => json!({"id": id, "rev": rev}),
        Err(rejection) => json!({"id": id, "error": rejection.error, "reason": rejection.reason}),
    }
}

fn next_revision(previous: Option<&Revision>, body: &Map<String, Value>) -> Revision {
    let generation = previous.and_then(Revision::generation).unwrap_or(0) + 1;
    let mut hasher = blake3::Hasher::new();
    if let Some(previous) = previous {
        hasher.update(previous.as_str().as_bytes());
    }
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    let digest = hasher.finalize();
    Revision::from_parts(generation, &hex::encode(&digest.as_bytes()[..16]))
}

fn new_uuid() -> String {
    Uuid::now_v7().simple().to_string()
}

fn poisoned() -> TransportError {
    TransportError::Unavailable("store state lock poisoned".into())
}
