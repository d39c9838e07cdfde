//! MCP session tracking and handshake replay.
//!
//! The remote server assigns a session id via the `mcp-session-id` response
//! header. When the server later answers 404 for that session, the proxy
//! replays the client's original `initialize` exchange under an internal
//! request id and resumes with the new session, invisibly to the client.

use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, info};

/// Prefix for request ids the proxy issues on its own behalf. Client ids are
/// plain JSON numbers or strings, so this namespace cannot collide with them
/// as long as clients do not use the prefix themselves.
pub const INTERNAL_ID_PREFIX: &str = "dbx-proxy:";

#[derive(Debug, Default)]
struct State {
    session_id: Option<String>,
    /// Params of the client's `initialize` request, kept for replay.
    initialize_params: Option<Value>,
    /// The client's `notifications/initialized` frame, kept for replay.
    initialized_frame: Option<Value>,
    handshake_seq: u64,
}

#[derive(Debug, Default)]
pub struct SessionManager {
    state: Mutex<State>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the client's `initialize` request so it can be replayed.
    pub fn record_initialize(&self, frame: &Value) {
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        self.lock().initialize_params = Some(params);
    }

    /// Records the client's `notifications/initialized` frame for replay.
    pub fn record_initialized(&self, frame: &Value) {
        self.lock().initialized_frame = Some(frame.clone());
    }

    /// Stores a session id observed on a response, replacing any previous one.
    pub fn observe_session_id(&self, header: Option<&str>) {
        if let Some(id) = header {
            let mut state = self.lock();
            if state.session_id.as_deref() != Some(id) {
                info!("session established");
                state.session_id = Some(id.to_string());
            }
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Drops the current session id after the server reports it expired.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        if state.session_id.take().is_some() {
            debug!("session invalidated");
        }
    }

    /// True once the client handshake has been seen, so expiry is recoverable.
    pub fn can_replay(&self) -> bool {
        self.lock().initialize_params.is_some()
    }

    /// Allocates an internal request id for a proxy-initiated request.
    pub fn next_internal_id(&self) -> String {
        let mut state = self.lock();
        state.handshake_seq += 1;
        format!("{INTERNAL_ID_PREFIX}{}", state.handshake_seq)
    }

    /// Rebuilds the `initialize` request under `id`, if one was recorded.
    pub fn replay_initialize_frame(&self, id: &str) -> Option<Value> {
        let params = self.lock().initialize_params.clone()?;
        Some(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": params,
        }))
    }

    /// Rebuilds the `notifications/initialized` frame, defaulting to a bare
    /// notification when the client's original was never seen.
    pub fn replay_initialized_frame(&self) -> Value {
        self.lock().initialized_frame.clone().unwrap_or_else(|| {
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
            })
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // State ops never panic while holding the lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// True for responses to requests the proxy issued itself.
pub fn is_internal_id(id: &Value) -> bool {
    id.as_str().is_some_and(|s| s.starts_with(INTERNAL_ID_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_requires_a_recorded_handshake() {
        let session = SessionManager::new();
        assert!(!session.can_replay());
        assert!(session.replay_initialize_frame("dbx-proxy:1").is_none());

        session.record_initialize(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26"},
        }));
        assert!(session.can_replay());

        let replay = session.replay_initialize_frame("dbx-proxy:1").unwrap();
        assert_eq!(replay["id"], "dbx-proxy:1");
        assert_eq!(replay["method"], "initialize");
        assert_eq!(replay["params"]["protocolVersion"], "2025-03-26");
    }

    #[test]
    fn internal_ids_are_namespaced_and_monotonic() {
        let session = SessionManager::new();
        let first = session.next_internal_id();
        let second = session.next_internal_id();
        assert_ne!(first, second);
        assert!(is_internal_id(&serde_json::json!(first)));
        assert!(!is_internal_id(&serde_json::json!(7)));
        assert!(!is_internal_id(&serde_json::json!("client-1")));
    }

    #[test]
    fn session_id_tracks_observe_and_invalidate() {
        let session = SessionManager::new();
        assert!(session.session_id().is_none());

        session.observe_session_id(None);
        assert!(session.session_id().is_none());

        session.observe_session_id(Some("sess-a"));
        assert_eq!(session.session_id().as_deref(), Some("sess-a"));

        session.observe_session_id(Some("sess-b"));
        assert_eq!(session.session_id().as_deref(), Some("sess-b"));

        session.invalidate();
        assert!(session.session_id().is_none());
    }

    #[test]
    fn initialized_replay_falls_back_to_bare_notification() {
        let session = SessionManager::new();
        let bare = session.replay_initialized_frame();
        assert_eq!(bare["method"], "notifications/initialized");
        assert!(bare.get("id").is_none());

        session.record_initialized(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {"custom": true},
        }));
        let replayed = session.replay_initialized_frame();
        assert_eq!(replayed["params"]["custom"], true);
    }
}
