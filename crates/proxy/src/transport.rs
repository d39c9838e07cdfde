//! Streamable HTTP transport to the remote MCP server.
//!
//! Each JSON-RPC frame is POSTed to the MCP endpoint. The server either
//! answers inline (JSON body), answers later over the GET SSE stream
//! (202 Accepted), or streams the answer in the POST response body itself
//! (SSE content type). Session affinity rides on the `mcp-session-id` header.

use std::time::Duration;

use dbx_jsonrpc::{classify, read_line_limited, FrameKind, PendingTable, RequestKey};
use futures_util::TryStreamExt;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::bridge::{send_frame, Outbound};

/// Response header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// How much of an error body to keep for diagnostics.
const ERROR_BODY_LIMIT: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 401 or 403: the bearer token was rejected.
    #[error("server rejected credentials (HTTP {status})")]
    Auth { status: u16 },
    /// 404 while presenting a session id: the session is gone.
    #[error("server no longer recognizes the session")]
    SessionExpired,
    #[error("server returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("stream error: {0}")]
    Stream(String),
    /// 405 on GET: the server only delivers responses inline on POST.
    #[error("server does not offer an event stream")]
    StreamUnsupported,
}

/// How the server delivered (or promised) the answer to a POST.
#[derive(Debug)]
pub enum Delivery {
    /// The response frame arrived in the POST exchange itself.
    Responded(Value),
    /// The POST body is itself an SSE stream scoped to this exchange; the
    /// caller pumps it until the server closes it.
    Streamed(EventStream),
    /// 202 or empty body: any response arrives over the event stream.
    Accepted,
}

#[derive(Debug)]
pub struct SendOutcome {
    /// Session id echoed or newly assigned by the server, if present.
    pub session_id: Option<String>,
    pub delivery: Delivery,
}

pub struct TransportClient {
    http: reqwest::Client,
    url: reqwest::Url,
    request_timeout: Duration,
    max_message_bytes: usize,
}

impl TransportClient {
    pub fn new(
        url: reqwest::Url,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_message_bytes: usize,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            url,
            request_timeout,
            max_message_bytes,
        })
    }

    /// POSTs one frame and classifies the outcome.
    pub async fn post(
        &self,
        frame: &Value,
        bearer: &str,
        session: Option<&str>,
    ) -> Result<SendOutcome, TransportError> {
        let mut req = self
            .http
            .post(self.url.clone())
            .timeout(self.request_timeout)
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(frame);
        if let Some(session) = session {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req.send().await.map_err(classify_send_error)?;
        let status = resp.status();
        let session_id = header_value(&resp, SESSION_HEADER);

        match status.as_u16() {
            401 | 403 => Err(TransportError::Auth {
                status: status.as_u16(),
            }),
            404 if session.is_some() => Err(TransportError::SessionExpired),
            202 => Ok(SendOutcome {
                session_id,
                delivery: Delivery::Accepted,
            }),
            _ if status.is_success() => {
                let delivery = self.read_post_body(resp).await?;
                Ok(SendOutcome {
                    session_id,
                    delivery,
                })
            }
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(TransportError::Http {
                    status: status.as_u16(),
                    body: truncate(body),
                })
            }
        }
    }

    async fn read_post_body(&self, resp: reqwest::Response) -> Result<Delivery, TransportError> {
        let is_sse = content_type(&resp)
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let status = resp.status().as_u16();

        if is_sse {
            // The server streams its answer, and possibly notifications
            // before it, in the POST body itself.
            Ok(Delivery::Streamed(EventStream::from_response(
                resp,
                self.max_message_bytes,
            )))
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|err| TransportError::Stream(redacted(err)))?;
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Delivery::Accepted);
            }
            let frame: Value = serde_json::from_slice(&body).map_err(|err| {
                TransportError::Http {
                    status,
                    body: format!("unparseable response body: {err}"),
                }
            })?;
            Ok(Delivery::Responded(frame))
        }
    }

    /// Opens the server-to-client event stream for the given session.
    pub async fn open_stream(
        &self,
        bearer: &str,
        session: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        let mut req = self
            .http
            .get(self.url.clone())
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(session) = session {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req.send().await.map_err(classify_send_error)?;
        let status = resp.status();
        match status.as_u16() {
            401 | 403 => Err(TransportError::Auth {
                status: status.as_u16(),
            }),
            404 if session.is_some() => Err(TransportError::SessionExpired),
            405 => Err(TransportError::StreamUnsupported),
            _ if status.is_success() => Ok(EventStream::from_response(
                resp,
                self.max_message_bytes,
            )),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(TransportError::Http {
                    status: status.as_u16(),
                    body: truncate(body),
                })
            }
        }
    }
}

fn classify_send_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(redacted(err))
    } else {
        TransportError::Stream(redacted(err))
    }
}

/// Strips the URL from a reqwest error before it reaches logs or error
/// frames; query strings can carry credentials.
fn redacted(err: reqwest::Error) -> String {
    err.without_url().to_string()
}

fn header_value(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

fn content_type(resp: &reqwest::Response) -> Option<String> {
    header_value(resp, reqwest::header::CONTENT_TYPE.as_str())
}

fn truncate(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        body.truncate(ERROR_BODY_LIMIT);
    }
    body
}

/// Incremental SSE parser over any line source.
///
/// `data:` lines are accumulated and joined with newlines; a blank line
/// dispatches the assembled event. `event:`, `id:`, `retry:`, and comment
/// lines are ignored, as are events that do not parse as JSON.
pub struct EventStream {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    max_bytes: usize,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    fn from_response(resp: reqwest::Response, max_bytes: usize) -> Self {
        let stream = Box::pin(
            resp.bytes_stream()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, redacted(err))),
        );
        Self {
            reader: Box::new(StreamReader::new(stream)),
            max_bytes,
        }
    }

    pub fn from_reader<R>(reader: R, max_bytes: usize) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            max_bytes,
        }
    }

    /// Returns the next JSON event, `Ok(None)` when the server closes the
    /// stream, or [`TransportError::Timeout`] after `idle_timeout` of silence.
    pub async fn next_event(
        &mut self,
        idle_timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        let mut data: Vec<String> = Vec::new();
        loop {
            let read = tokio::time::timeout(
                idle_timeout,
                read_line_limited(&mut self.reader, self.max_bytes),
            )
            .await
            .map_err(|_| TransportError::Timeout)?;

            let line = match read {
                Ok(Some(line)) => line,
                // A partial event at EOF is discarded per the SSE model.
                Ok(None) => return Ok(None),
                Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("dropping oversized event");
                    data.clear();
                    continue;
                }
                Err(err) => return Err(TransportError::Stream(err.to_string())),
            };

            if line.is_empty() {
                if data.is_empty() {
                    continue;
                }
                let payload = data.join("\n");
                data.clear();
                match serde_json::from_str::<Value>(&payload) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => {
                        warn!(error = %err, "skipping non-JSON event");
                        continue;
                    }
                }
            } else if let Some(rest) = strip_field(&line, "data") {
                data.push(rest.to_string());
            }
            // event:, id:, retry:, and comment lines are not interesting here.
        }
    }
}

/// Strips an SSE field prefix (`data:` or `data: `), returning the value.
fn strip_field<'a>(line: &'a [u8], field: &str) -> Option<&'a str> {
    let line = std::str::from_utf8(line).ok()?;
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Routes frames arriving from the server.
///
/// Responses are matched against the pending table; everything the proxy did
/// not ask for itself is forwarded to the client verbatim. Responses to
/// unknown ids are dropped so a confused server cannot corrupt the client's
/// own correlation state.
pub struct Demux {
    pending: PendingTable,
    outbound: mpsc::Sender<Outbound>,
}

impl Demux {
    pub fn new(pending: PendingTable, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { pending, outbound }
    }

    /// Dispatches one server frame. `Err(())` means the client writer is gone.
    pub async fn dispatch(&self, frame: Value) -> Result<(), ()> {
        match classify(&frame) {
            Ok(FrameKind::Response { id }) => {
                let Some(key) = RequestKey::from_id(&id) else {
                    warn!("dropping response with unusable id");
                    return Ok(());
                };
                match self.pending.take(&key).await {
                    Some(entry) => match entry.waiter {
                        Some(waiter) => {
                            // Proxy-initiated request; never reaches stdout.
                            let _ = waiter.send(frame);
                            Ok(())
                        }
                        None => send_frame(&self.outbound, &frame).await,
                    },
                    None => {
                        // Late responses after a timeout land here, as do
                        // stray answers to already-settled internal requests.
                        debug!(
                            %key,
                            internal = crate::session::is_internal_id(&id),
                            "dropping response for unknown or settled id"
                        );
                        Ok(())
                    }
                }
            }
            // Server-initiated requests and notifications pass straight through.
            Ok(FrameKind::Request { .. }) | Ok(FrameKind::Notification { .. }) => {
                send_frame(&self.outbound, &frame).await
            }
            Err(err) => {
                warn!(error = %err, "dropping malformed server frame");
                Ok(())
            }
        }
    }
}
