//! Request paths of the CouchDB document protocol.

/// Server welcome / version.
pub const ROOT: &str = "/";
/// List of all databases.
pub const ALL_DBS: &str = "/_all_dbs";

/// `GET` a batch of server-issued UUIDs.
pub fn uuids(count: usize) -> String {
    format!("/_uuids?count={count}")
}

/// Database-level path (create, drop, info, `POST` a new document).
pub fn database(db: &str) -> String {
    format!("/{}", encode_segment(db))
}

/// Single-document path.
pub fn document(db: &str, id: &str) -> String {
    format!("/{}/{}", encode_segment(db), encode_segment(id))
}

/// Single-document path carrying a revision (used by `DELETE`).
pub fn document_rev(db: &str, id: &str, rev: &str) -> String {
    format!("{}?rev={}", document(db, id), encode_segment(rev))
}

/// Bulk read with document bodies included.
pub fn all_docs(db: &str) -> String {
    format!("/{}/_all_docs?include_docs=true", encode_segment(db))
}

/// Bulk write.
pub fn bulk_docs(db: &str) -> String {
    format!("/{}/_bulk_docs", encode_segment(db))
}

/// Percent-encode everything except RFC 3986 unreserved characters.
pub fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_segment`]. Malformed escapes are kept literally.
pub fn decode_segment(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}
