//! Wires stdin, the uplink, the event stream, and stdout together.
//!
//! One task per concern: the main task reads client frames, a single uplink
//! task POSTs them in arrival order, a stream task pumps SSE events, a
//! watchdog per request enforces the deadline, and the writer task owns
//! stdout. The pending table's take-once semantics make the races between
//! them harmless.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dbx_jsonrpc::{
    error_response, FrameKind, PendingEntry, PendingTable, RequestKey, INVALID_REQUEST,
    REQUEST_TIMEOUT, TRANSPORT_ERROR,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::{send_frame, spawn_writer, FrameReader, InboundFrame, Outbound, ReadEvent};
use crate::config::ProxyConfig;
use crate::credentials::CredentialProvider;
use crate::session::SessionManager;
use crate::transport::{Delivery, Demux, EventStream, SendOutcome, TransportClient, TransportError};

/// Exit code for invalid command line arguments or environment, kept clear
/// of the bridge's own 0-3 contract so supervisors can tell them apart.
pub const EXIT_USAGE: i32 = 64;
/// Exit code for a failure before any traffic was bridged.
pub const EXIT_STARTUP: i32 = 70;

/// Why the proxy stopped; maps directly to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// stdin closed and in-flight work was drained.
    Clean,
    /// Credentials were rejected and could not be refreshed.
    AuthFailure,
    /// The remote server stayed unreachable after retrying.
    RemoteUnreachable,
    /// stdout went away underneath us.
    BrokenPipe,
}

impl ExitReason {
    pub fn code(self) -> i32 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::AuthFailure => 1,
            ExitReason::RemoteUnreachable => 2,
            ExitReason::BrokenPipe => 3,
        }
    }
}

/// A send attempt that will not be retried further.
enum SendFailure {
    /// The whole proxy must stop.
    Fatal(ExitReason),
    /// Only this request failed; the client gets an error response.
    Request { code: i64, message: String },
}

struct Inner {
    config: ProxyConfig,
    transport: TransportClient,
    credentials: CredentialProvider,
    session: SessionManager,
    pending: PendingTable,
    outbound: mpsc::Sender<Outbound>,
    fatal: watch::Sender<Option<ExitReason>>,
    stream_running: AtomicBool,
    /// Consecutive token-acquisition failures; two in a row are fatal.
    auth_failures: AtomicU32,
}

impl Inner {
    /// Records the first fatal reason; later ones lose the race and are kept
    /// only in the logs.
    fn set_fatal(&self, reason: ExitReason) {
        self.fatal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn fatal_reason(&self) -> Option<ExitReason> {
        *self.fatal.borrow()
    }

    fn demux(&self) -> Demux {
        Demux::new(self.pending.clone(), self.outbound.clone())
    }
}

/// Runs the proxy over real stdin/stdout.
pub async fn run(config: ProxyConfig) -> anyhow::Result<ExitReason> {
    run_with_io(config, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Runs the proxy over arbitrary streams; the seam the integration tests use.
pub async fn run_with_io<R, W>(config: ProxyConfig, input: R, output: W) -> anyhow::Result<ExitReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(url = %config.mcp_url, "proxy starting");

    let (outbound, mut writer_handle) = spawn_writer(output);
    let transport = TransportClient::new(
        config.mcp_url.clone(),
        config.connect_timeout,
        config.request_timeout,
        config.max_message_bytes,
    )?;
    let credentials =
        CredentialProvider::new(config.credentials.clone(), config.databricks_host.clone())
            .with_cli_program(config.token_cli.clone());
    let (fatal_tx, mut fatal_rx) = watch::channel(None::<ExitReason>);

    let inner = Arc::new(Inner {
        config,
        transport,
        credentials,
        session: SessionManager::new(),
        pending: PendingTable::new(),
        outbound,
        fatal: fatal_tx,
        stream_running: AtomicBool::new(false),
        auth_failures: AtomicU32::new(0),
    });

    let (uplink_tx, uplink_rx) = mpsc::channel::<InboundFrame>(64);
    let uplink = tokio::spawn(run_uplink(inner.clone(), uplink_rx));
    let mut reader = FrameReader::new(BufReader::new(input), inner.config.max_message_bytes);

    let mut fatal_exit: Option<ExitReason> = None;
    loop {
        tokio::select! {
            event = reader.next() => match event {
                Ok(Some(ReadEvent::Frame(frame))) => {
                    // Handshake frames are remembered for session replay
                    // before they are forwarded like any other frame.
                    match &frame.kind {
                        FrameKind::Request { method, .. } if method == "initialize" => {
                            inner.session.record_initialize(&frame.value);
                        }
                        FrameKind::Notification { method }
                            if method == "notifications/initialized" =>
                        {
                            inner.session.record_initialized(&frame.value);
                        }
                        _ => {}
                    }
                    if uplink_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(Some(ReadEvent::Malformed(error_frame))) => {
                    if send_frame(&inner.outbound, &error_frame).await.is_err() {
                        fatal_exit = Some(ExitReason::BrokenPipe);
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    break;
                }
            },
            result = &mut writer_handle => {
                match result {
                    Ok(Ok(())) => warn!("stdout writer exited early"),
                    Ok(Err(err)) => warn!(error = %err, "stdout write failed"),
                    Err(err) => warn!(error = %err, "stdout writer task failed"),
                }
                fatal_exit = Some(ExitReason::BrokenPipe);
                break;
            },
            _ = fatal_rx.changed() => {
                if let Some(reason) = *fatal_rx.borrow_and_update() {
                    fatal_exit = Some(reason);
                    break;
                }
            },
        }
    }

    drop(uplink_tx);

    if let Some(reason) = fatal_exit {
        uplink.abort();
        if reason != ExitReason::BrokenPipe {
            cancel_pending(&inner, "proxy shutting down").await;
            let (ack_tx, ack_rx) = oneshot::channel();
            if inner.outbound.send(Outbound::Shutdown(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
        return Ok(reason);
    }

    // Graceful drain: finish queued sends, then give in-flight requests a
    // grace period to be answered over the event stream.
    if let Err(err) = uplink.await {
        warn!(error = %err, "uplink task failed");
    }
    let _ = tokio::time::timeout(inner.config.drain_grace, wait_until_settled(&inner.pending)).await;
    cancel_pending(&inner, "shutting down before the response arrived").await;

    if let Some(reason) = inner.fatal_reason() {
        return Ok(reason);
    }

    let (ack_tx, ack_rx) = oneshot::channel();
    if inner.outbound.send(Outbound::Shutdown(ack_tx)).await.is_err() || ack_rx.await.is_err() {
        return Ok(ExitReason::BrokenPipe);
    }
    info!("proxy exiting cleanly");
    Ok(ExitReason::Clean)
}

/// Forwards client frames one at a time, preserving arrival order.
async fn run_uplink(inner: Arc<Inner>, mut rx: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = rx.recv().await {
        match frame.kind {
            FrameKind::Request { id, method } => {
                forward_request(&inner, frame.value, id, method).await;
            }
            FrameKind::Notification { method } => {
                forward_fire_and_forget(&inner, frame.value, &method).await;
            }
            // The client answering a server-initiated request.
            FrameKind::Response { .. } => {
                forward_fire_and_forget(&inner, frame.value, "response").await;
            }
        }
        if inner.fatal_reason().is_some() {
            return;
        }
    }
}

async fn forward_request(inner: &Arc<Inner>, frame: Value, id: Value, method: String) {
    let Some(key) = RequestKey::from_id(&id) else {
        respond_error(
            inner,
            id,
            INVALID_REQUEST,
            "request id must be a string or number",
        )
        .await;
        return;
    };

    let entry = PendingEntry::new(id.clone(), method.clone());
    if inner.pending.insert(key.clone(), entry).await.is_err() {
        respond_error(inner, id, INVALID_REQUEST, "request id already in flight").await;
        return;
    }
    spawn_watchdog(inner.clone(), key.clone());

    debug!(%method, "forwarding request");
    match send_with_recovery(inner, &frame).await {
        Ok(outcome) => {
            match outcome.delivery {
                Delivery::Responded(response) => {
                    if inner.demux().dispatch(response).await.is_err() {
                        inner.set_fatal(ExitReason::BrokenPipe);
                    }
                }
                // The answer (and anything before it) rides the POST body.
                Delivery::Streamed(stream) => pump_post_stream(inner, stream).await,
                // 202: the answer arrives over the event stream.
                Delivery::Accepted => {}
            }
            ensure_stream(inner).await;
        }
        Err(SendFailure::Fatal(reason)) => {
            // Answer the request before flagging the failure so the error
            // frame is queued ahead of shutdown.
            if inner.pending.take(&key).await.is_some() {
                respond_error(inner, id, TRANSPORT_ERROR, "proxy shutting down").await;
            }
            inner.set_fatal(reason);
        }
        Err(SendFailure::Request { code, message }) => {
            // The watchdog may have answered already; take() decides.
            if inner.pending.take(&key).await.is_some() {
                respond_error(inner, id, code, message).await;
            }
        }
    }
}

/// Forwards a frame that expects no correlated response.
async fn forward_fire_and_forget(inner: &Arc<Inner>, frame: Value, what: &str) {
    match send_with_recovery(inner, &frame).await {
        Ok(outcome) => {
            match outcome.delivery {
                Delivery::Responded(response) => {
                    if inner.demux().dispatch(response).await.is_err() {
                        inner.set_fatal(ExitReason::BrokenPipe);
                    }
                }
                Delivery::Streamed(stream) => pump_post_stream(inner, stream).await,
                Delivery::Accepted => {}
            }
            ensure_stream(inner).await;
        }
        Err(SendFailure::Fatal(reason)) => inner.set_fatal(reason),
        Err(SendFailure::Request { message, .. }) => {
            warn!(kind = what, %message, "delivery failed");
        }
    }
}

/// POSTs a frame, absorbing one recoverable failure of each kind: a rejected
/// token (refresh and retry), an expired session (re-handshake and retry),
/// and a failed connection (brief pause and retry).
async fn send_with_recovery(inner: &Arc<Inner>, frame: &Value) -> Result<SendOutcome, SendFailure> {
    let mut auth_retry = true;
    let mut session_retry = true;
    let mut connect_retry = true;

    loop {
        let bearer = match inner.credentials.bearer_token().await {
            Ok(bearer) => {
                inner.auth_failures.store(0, Ordering::SeqCst);
                bearer
            }
            Err(err) => {
                error!(error = %err, "could not obtain a token");
                return Err(note_auth_failure(inner, &err));
            }
        };
        let session = inner.session.session_id();

        match inner.transport.post(frame, &bearer, session.as_deref()).await {
            Ok(outcome) => {
                inner.session.observe_session_id(outcome.session_id.as_deref());
                return Ok(outcome);
            }
            Err(TransportError::Auth { status }) if auth_retry => {
                auth_retry = false;
                warn!(status, "credentials rejected, refreshing token");
                if let Err(err) = inner.credentials.force_refresh(&bearer).await {
                    error!(error = %err, "token refresh failed");
                    return Err(SendFailure::Fatal(ExitReason::AuthFailure));
                }
            }
            Err(TransportError::Auth { status }) => {
                error!(status, "credentials rejected after refresh");
                return Err(SendFailure::Fatal(ExitReason::AuthFailure));
            }
            Err(TransportError::SessionExpired)
                if session_retry && inner.session.can_replay() =>
            {
                session_retry = false;
                info!("session expired, replaying handshake");
                inner.session.invalidate();
                rehandshake(inner).await?;
            }
            Err(TransportError::SessionExpired) => {
                inner.session.invalidate();
                return Err(SendFailure::Request {
                    code: TRANSPORT_ERROR,
                    message: "session expired and could not be re-established".to_string(),
                });
            }
            Err(TransportError::Connect(message)) if connect_retry => {
                connect_retry = false;
                warn!(error = %message, "connection failed, retrying");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(TransportError::Connect(message)) => {
                error!(error = %message, "server unreachable");
                return Err(SendFailure::Fatal(ExitReason::RemoteUnreachable));
            }
            Err(TransportError::Timeout) => {
                return Err(SendFailure::Request {
                    code: REQUEST_TIMEOUT,
                    message: "request timed out".to_string(),
                });
            }
            Err(err) => {
                return Err(SendFailure::Request {
                    code: TRANSPORT_ERROR,
                    message: err.to_string(),
                });
            }
        }
    }
}

/// One failed token mint fails only the request in hand; a second in a row
/// means the credential source itself is broken and the proxy stops.
fn note_auth_failure(inner: &Inner, err: &crate::credentials::AuthError) -> SendFailure {
    let failures = inner.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
    if failures >= 2 {
        SendFailure::Fatal(ExitReason::AuthFailure)
    } else {
        SendFailure::Request {
            code: TRANSPORT_ERROR,
            message: format!("could not obtain a token: {err}"),
        }
    }
}

/// Replays the client's `initialize` exchange under an internal id to obtain
/// a fresh session. The client never sees any of these frames.
async fn rehandshake(inner: &Arc<Inner>) -> Result<(), SendFailure> {
    let internal_id = inner.session.next_internal_id();
    let Some(init_frame) = inner.session.replay_initialize_frame(&internal_id) else {
        return Err(SendFailure::Request {
            code: TRANSPORT_ERROR,
            message: "no handshake recorded to replay".to_string(),
        });
    };

    let id_value = Value::String(internal_id);
    let Some(key) = RequestKey::from_id(&id_value) else {
        return Err(SendFailure::Request {
            code: TRANSPORT_ERROR,
            message: "internal id allocation failed".to_string(),
        });
    };
    let (waiter_tx, waiter_rx) = oneshot::channel();
    let entry = PendingEntry::new(id_value, "initialize").with_waiter(waiter_tx);
    if inner.pending.insert(key.clone(), entry).await.is_err() {
        return Err(SendFailure::Request {
            code: TRANSPORT_ERROR,
            message: "handshake replay already in flight".to_string(),
        });
    }

    let bearer = match inner.credentials.bearer_token().await {
        Ok(bearer) => bearer,
        Err(err) => {
            inner.pending.take(&key).await;
            error!(error = %err, "could not obtain a token for handshake replay");
            return Err(note_auth_failure(inner, &err));
        }
    };

    // No session header: this POST creates the replacement session.
    let outcome = match inner.transport.post(&init_frame, &bearer, None).await {
        Ok(outcome) => outcome,
        Err(err) => {
            inner.pending.take(&key).await;
            return Err(match err {
                TransportError::Auth { .. } => SendFailure::Fatal(ExitReason::AuthFailure),
                TransportError::Connect(_) => SendFailure::Fatal(ExitReason::RemoteUnreachable),
                other => SendFailure::Request {
                    code: TRANSPORT_ERROR,
                    message: format!("handshake replay failed: {other}"),
                },
            });
        }
    };
    inner.session.observe_session_id(outcome.session_id.as_deref());

    match outcome.delivery {
        Delivery::Responded(response) => {
            // Routed through the demultiplexer so the waiter fires.
            let _ = inner.demux().dispatch(response).await;
        }
        Delivery::Streamed(stream) => pump_post_stream(inner, stream).await,
        Delivery::Accepted => ensure_stream(inner).await,
    }

    let response = match tokio::time::timeout(inner.config.request_timeout, waiter_rx).await {
        Ok(Ok(response)) => response,
        _ => {
            inner.pending.take(&key).await;
            return Err(SendFailure::Request {
                code: REQUEST_TIMEOUT,
                message: "handshake replay timed out".to_string(),
            });
        }
    };
    if response.get("error").is_some() {
        return Err(SendFailure::Request {
            code: TRANSPORT_ERROR,
            message: "server rejected the replayed handshake".to_string(),
        });
    }

    let initialized = inner.session.replay_initialized_frame();
    let bearer = match inner.credentials.bearer_token().await {
        Ok(bearer) => bearer,
        Err(err) => return Err(note_auth_failure(inner, &err)),
    };
    let session = inner.session.session_id();
    if let Err(err) = inner
        .transport
        .post(&initialized, &bearer, session.as_deref())
        .await
    {
        warn!(error = %err, "failed to deliver the initialized notification");
    }
    info!("session re-established");
    Ok(())
}

/// Spawns the GET event stream task if a session exists and no stream task
/// is already running.
async fn ensure_stream(inner: &Arc<Inner>) {
    if inner.session.session_id().is_none() {
        return;
    }
    if inner.stream_running.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move {
        run_stream(&inner).await;
        inner.stream_running.store(false, Ordering::SeqCst);
    });
}

/// Pumps the server's event stream into the demultiplexer, reopening it when
/// it closes or goes idle. Returns when the session disappears, the server
/// declines streaming, or the proxy is going down.
async fn run_stream(inner: &Arc<Inner>) {
    let demux = inner.demux();
    let mut auth_retry = true;

    loop {
        if inner.fatal_reason().is_some() {
            return;
        }
        let Some(session) = inner.session.session_id() else {
            return;
        };
        let bearer = match inner.credentials.bearer_token().await {
            Ok(bearer) => bearer,
            Err(err) => {
                // Requests surface their own token errors; the stream just
                // stays down until one succeeds.
                warn!(error = %err, "could not obtain a token for the event stream");
                return;
            }
        };

        let mut stream = match inner.transport.open_stream(&bearer, Some(&session)).await {
            Ok(stream) => {
                auth_retry = true;
                stream
            }
            Err(TransportError::StreamUnsupported) => {
                debug!("server declines the event stream; responses arrive inline");
                return;
            }
            Err(TransportError::Auth { status }) if auth_retry => {
                auth_retry = false;
                warn!(status, "event stream rejected, refreshing token");
                if inner.credentials.force_refresh(&bearer).await.is_err() {
                    inner.set_fatal(ExitReason::AuthFailure);
                    return;
                }
                continue;
            }
            Err(TransportError::Auth { status }) => {
                error!(status, "event stream rejected after refresh");
                inner.set_fatal(ExitReason::AuthFailure);
                return;
            }
            Err(TransportError::SessionExpired) => {
                // The next POST replays the handshake and reopens the stream.
                inner.session.invalidate();
                return;
            }
            Err(err) => {
                warn!(error = %err, "event stream failed to open, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        loop {
            match stream.next_event(inner.config.sse_idle_timeout).await {
                Ok(Some(frame)) => {
                    if demux.dispatch(frame).await.is_err() {
                        inner.set_fatal(ExitReason::BrokenPipe);
                        return;
                    }
                }
                Ok(None) => {
                    debug!("event stream closed, reopening");
                    break;
                }
                Err(TransportError::Timeout) => {
                    debug!("event stream idle, reopening");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "event stream error, reopening");
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Drains a POST-scoped event stream, routing every frame through the
/// demultiplexer until the server closes the body. Whichever frame carries
/// the response settles the pending entry along the way; a stream that ends
/// without one leaves the watchdog to answer the request.
async fn pump_post_stream(inner: &Arc<Inner>, mut stream: EventStream) {
    let demux = inner.demux();
    loop {
        match stream.next_event(inner.config.request_timeout).await {
            Ok(Some(frame)) => {
                if demux.dispatch(frame).await.is_err() {
                    inner.set_fatal(ExitReason::BrokenPipe);
                    return;
                }
            }
            Ok(None) => return,
            Err(TransportError::Timeout) => {
                warn!("response stream went silent, abandoning it");
                return;
            }
            Err(err) => {
                warn!(error = %err, "response stream failed");
                return;
            }
        }
    }
}

/// Answers the request with a timeout error if nothing else answered first.
fn spawn_watchdog(inner: Arc<Inner>, key: RequestKey) {
    tokio::spawn(async move {
        tokio::time::sleep(inner.config.request_timeout).await;
        if let Some(entry) = inner.pending.take(&key).await {
            warn!(method = %entry.method, "request timed out");
            let frame = error_response(entry.id, REQUEST_TIMEOUT, "request timed out", None);
            if send_frame(&inner.outbound, &frame).await.is_err() {
                inner.set_fatal(ExitReason::BrokenPipe);
            }
        }
    });
}

async fn respond_error(inner: &Inner, id: Value, code: i64, message: impl Into<String>) {
    let frame = error_response(id, code, message.into(), None);
    if send_frame(&inner.outbound, &frame).await.is_err() {
        inner.set_fatal(ExitReason::BrokenPipe);
    }
}

/// Fails every still-pending request. Internal waiters are simply dropped;
/// client requests get a timeout error so nothing hangs on the other side.
async fn cancel_pending(inner: &Inner, message: &str) {
    for (_key, entry) in inner.pending.drain().await {
        match entry.waiter {
            Some(waiter) => drop(waiter),
            None => respond_error(inner, entry.id, REQUEST_TIMEOUT, message).await,
        }
    }
}

async fn wait_until_settled(pending: &PendingTable) {
    loop {
        if pending.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialMode;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(ExitReason::Clean.code(), 0);
        assert_eq!(ExitReason::AuthFailure.code(), 1);
        assert_eq!(ExitReason::RemoteUnreachable.code(), 2);
        assert_eq!(ExitReason::BrokenPipe.code(), 3);

        // Startup failures must be distinguishable from every bridge outcome.
        for reason in [
            ExitReason::Clean,
            ExitReason::AuthFailure,
            ExitReason::RemoteUnreachable,
            ExitReason::BrokenPipe,
        ] {
            assert_ne!(reason.code(), EXIT_USAGE);
            assert_ne!(reason.code(), EXIT_STARTUP);
        }
    }

    fn test_inner(outbound: mpsc::Sender<Outbound>) -> Inner {
        let config = ProxyConfig {
            mcp_url: reqwest::Url::parse("http://127.0.0.1:9/mcp").unwrap(),
            databricks_host: None,
            credentials: CredentialMode::StaticToken("tok".to_string()),
            request_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            sse_idle_timeout: Duration::from_secs(1),
            drain_grace: Duration::from_millis(100),
            max_message_bytes: 4096,
            token_cli: "databricks".to_string(),
        };
        let transport = TransportClient::new(
            config.mcp_url.clone(),
            config.connect_timeout,
            config.request_timeout,
            config.max_message_bytes,
        )
        .unwrap();
        let credentials =
            CredentialProvider::new(config.credentials.clone(), config.databricks_host.clone());
        let (fatal, _) = watch::channel(None);
        Inner {
            config,
            transport,
            credentials,
            session: SessionManager::new(),
            pending: PendingTable::new(),
            outbound,
            fatal,
            stream_running: AtomicBool::new(false),
            auth_failures: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn cancel_pending_answers_client_requests_and_drops_waiters() {
        let (tx, mut rx) = mpsc::channel(8);
        let inner = test_inner(tx);

        let client_key = RequestKey::from_id(&serde_json::json!(1)).unwrap();
        inner
            .pending
            .insert(
                client_key,
                PendingEntry::new(serde_json::json!(1), "tools/call"),
            )
            .await
            .unwrap();

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let internal_key = RequestKey::from_id(&serde_json::json!("dbx-proxy:1")).unwrap();
        inner
            .pending
            .insert(
                internal_key,
                PendingEntry::new(serde_json::json!("dbx-proxy:1"), "initialize")
                    .with_waiter(waiter_tx),
            )
            .await
            .unwrap();

        cancel_pending(&inner, "shutting down").await;

        // Exactly one frame reaches the client, for the client's own request.
        let frame = match rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        };
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["error"]["code"], REQUEST_TIMEOUT);
        assert!(rx.try_recv().is_err());

        assert!(waiter_rx.await.is_err());
        assert!(inner.pending.is_empty().await);
    }

    #[tokio::test]
    async fn first_fatal_reason_wins() {
        let (tx, _rx) = mpsc::channel(8);
        let inner = test_inner(tx);
        inner.set_fatal(ExitReason::RemoteUnreachable);
        inner.set_fatal(ExitReason::BrokenPipe);
        assert_eq!(inner.fatal_reason(), Some(ExitReason::RemoteUnreachable));
    }
}
