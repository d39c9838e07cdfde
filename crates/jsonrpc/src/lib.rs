//! Line-delimited JSON-RPC 2.0 plumbing shared by the proxy.
//!
//! This crate is transport-agnostic: it knows how to frame messages (one JSON
//! object per line), classify incoming frames, build standard error objects,
//! and correlate responses to in-flight requests via [`PendingTable`]. It does
//! not know about stdin, HTTP, or SSE.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::oneshot;

/// JSON-RPC parse error (malformed JSON on the wire).
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC invalid request (well-formed JSON, not a valid request object).
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC internal error.
pub const INTERNAL_ERROR: i64 = -32603;
/// Implementation-defined: the HTTP transport failed for this request.
pub const TRANSPORT_ERROR: i64 = -32000;
/// Implementation-defined: the request timed out or was cancelled at shutdown.
pub const REQUEST_TIMEOUT: i64 = -32001;

/// Upper bound applied to stdin lines and assembled SSE events.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate request id: {0}")]
    DuplicateId(RequestKey),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Hashable key derived from a JSON-RPC request id.
///
/// JSON-RPC allows string and integer ids; the key embeds a type tag so the
/// number `1` and the string `"1"` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    /// Returns `None` for ids that are not valid request ids (`null`, arrays,
    /// objects, booleans).
    pub fn from_id(id: &Value) -> Option<Self> {
        match id {
            Value::Number(n) => Some(Self(format!("n:{n}"))),
            Value::String(s) => Some(Self(format!("s:{s}"))),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Classification of a parsed JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// Has a method and an id; expects exactly one correlated response.
    Request { id: Value, method: String },
    /// Has a method but no id; fire-and-forget.
    Notification { method: String },
    /// Has an id and a result or error; answers an earlier request.
    Response { id: Value },
}

/// Classifies a parsed JSON value as a JSON-RPC frame.
///
/// A `null` id is treated as absent, matching the convention that only
/// error responses to unparseable requests carry `id: null`.
pub fn classify(value: &Value) -> Result<FrameKind, Error> {
    if !value.is_object() {
        return Err(Error::Protocol("frame is not a JSON object".to_string()));
    }

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let id = value.get("id").filter(|id| !id.is_null()).cloned();

    match (method, id) {
        (Some(method), Some(id)) => Ok(FrameKind::Request { id, method }),
        (Some(method), None) => Ok(FrameKind::Notification { method }),
        (None, Some(id)) => {
            if value.get("result").is_some() || value.get("error").is_some() {
                Ok(FrameKind::Response { id })
            } else {
                Err(Error::Protocol(
                    "frame has an id but no method, result, or error".to_string(),
                ))
            }
        }
        (None, None) => Err(Error::Protocol(
            "frame has neither method nor id".to_string(),
        )),
    }
}

/// Builds a JSON-RPC error response object.
pub fn error_response(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Option<Value>,
) -> Value {
    let mut error = serde_json::json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

/// Reads one `\n`-terminated line, stripping the terminator and a trailing
/// `\r`, with a hard size cap.
///
/// Returns `Ok(None)` at EOF. When a line exceeds `max_bytes` the remainder of
/// that line is consumed and discarded before the `InvalidData` error is
/// returned, so the caller can resynchronize on the next line.
pub async fn read_line_limited<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let (consumed, complete) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                // EOF with a partial final line: hand it back as-is.
                trim_trailing_cr(&mut line);
                return Ok(Some(line));
            }

            match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    if line.len().saturating_add(pos) > max_bytes {
                        (pos + 1, Err(oversize_error(max_bytes)))
                    } else {
                        line.extend_from_slice(&buf[..pos]);
                        (pos + 1, Ok(true))
                    }
                }
                None => {
                    if line.len().saturating_add(buf.len()) > max_bytes {
                        let consumed = buf.len();
                        reader.consume(consumed);
                        discard_until_newline(reader).await?;
                        return Err(oversize_error(max_bytes));
                    }
                    line.extend_from_slice(buf);
                    (buf.len(), Ok(false))
                }
            }
        };

        reader.consume(consumed);
        match complete {
            Ok(true) => {
                trim_trailing_cr(&mut line);
                return Ok(Some(line));
            }
            Ok(false) => {}
            Err(err) => return Err(err),
        }
    }
}

fn oversize_error(max_bytes: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message exceeds {max_bytes} bytes"),
    )
}

fn trim_trailing_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

async fn discard_until_newline<R>(reader: &mut R) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let (consumed, done) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

/// One in-flight request awaiting its correlated response.
#[derive(Debug)]
pub struct PendingEntry {
    /// Original JSON-RPC id, kept verbatim for error responses.
    pub id: Value,
    pub method: String,
    pub submitted_at: Instant,
    /// When set, the response is delivered here instead of being forwarded;
    /// used for requests the proxy issues on its own behalf.
    pub waiter: Option<oneshot::Sender<Value>>,
}

impl PendingEntry {
    pub fn new(id: Value, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            submitted_at: Instant::now(),
            waiter: None,
        }
    }

    pub fn with_waiter(mut self, waiter: oneshot::Sender<Value>) -> Self {
        self.waiter = Some(waiter);
        self
    }
}

/// Shared table of in-flight requests keyed by request id.
///
/// `take` removes the entry, so each id is fulfilled at most once no matter
/// how many tasks race on it (response demultiplexer, per-request watchdog,
/// shutdown drain).
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    inner: Arc<tokio::sync::Mutex<HashMap<RequestKey, PendingEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an in-flight request. Fails when the id is already in flight.
    pub async fn insert(&self, key: RequestKey, entry: PendingEntry) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(&key) {
            return Err(Error::DuplicateId(key));
        }
        inner.insert(key, entry);
        Ok(())
    }

    /// Removes and returns the entry for `key`, if still in flight.
    pub async fn take(&self, key: &RequestKey) -> Option<PendingEntry> {
        self.inner.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Removes and returns every in-flight entry, for shutdown cancellation.
    pub async fn drain(&self) -> Vec<(RequestKey, PendingEntry)> {
        let mut inner = self.inner.lock().await;
        std::mem::take(&mut *inner).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keys_distinguish_numbers_from_strings() {
        let numeric = RequestKey::from_id(&serde_json::json!(1)).unwrap();
        let string = RequestKey::from_id(&serde_json::json!("1")).unwrap();
        assert_ne!(numeric, string);

        assert!(RequestKey::from_id(&Value::Null).is_none());
        assert!(RequestKey::from_id(&serde_json::json!([1])).is_none());
        assert!(RequestKey::from_id(&serde_json::json!(true)).is_none());
    }

    #[test]
    fn classify_covers_requests_notifications_and_responses() {
        let req = serde_json::json!({"jsonrpc":"2.0","id":7,"method":"tools/list"});
        assert_eq!(
            classify(&req).unwrap(),
            FrameKind::Request {
                id: serde_json::json!(7),
                method: "tools/list".to_string()
            }
        );

        let note = serde_json::json!({"jsonrpc":"2.0","method":"notifications/initialized"});
        assert_eq!(
            classify(&note).unwrap(),
            FrameKind::Notification {
                method: "notifications/initialized".to_string()
            }
        );

        let resp = serde_json::json!({"jsonrpc":"2.0","id":"a","result":{}});
        assert_eq!(
            classify(&resp).unwrap(),
            FrameKind::Response {
                id: serde_json::json!("a")
            }
        );

        // A null id counts as absent.
        let err_note = serde_json::json!({"jsonrpc":"2.0","id":null,"method":"m"});
        assert!(matches!(
            classify(&err_note).unwrap(),
            FrameKind::Notification { .. }
        ));

        assert!(classify(&serde_json::json!({"jsonrpc":"2.0","id":1})).is_err());
        assert!(classify(&serde_json::json!("not an object")).is_err());
    }

    #[test]
    fn error_response_shape() {
        let resp = error_response(Value::Null, PARSE_ERROR, "bad json", None);
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["error"]["code"], PARSE_ERROR);
        assert_eq!(resp["error"]["message"], "bad json");
        assert!(resp["error"].get("data").is_none());

        let with_data = error_response(
            serde_json::json!(3),
            TRANSPORT_ERROR,
            "http error",
            Some(serde_json::json!({"status": 503})),
        );
        assert_eq!(with_data["error"]["data"]["status"], 503);
    }

    #[tokio::test]
    async fn pending_table_fulfills_each_id_at_most_once() {
        let table = PendingTable::new();
        let key = RequestKey::from_id(&serde_json::json!(1)).unwrap();
        table
            .insert(key.clone(), PendingEntry::new(serde_json::json!(1), "ping"))
            .await
            .unwrap();

        assert!(table.take(&key).await.is_some());
        assert!(table.take(&key).await.is_none());
    }

    #[tokio::test]
    async fn pending_table_rejects_duplicate_ids() {
        let table = PendingTable::new();
        let key = RequestKey::from_id(&serde_json::json!("x")).unwrap();
        table
            .insert(key.clone(), PendingEntry::new(serde_json::json!("x"), "a"))
            .await
            .unwrap();
        let second = table
            .insert(key.clone(), PendingEntry::new(serde_json::json!("x"), "b"))
            .await;
        assert!(matches!(second, Err(Error::DuplicateId(_))));
    }
}
