//! Agent session state shared between the session task and the liveness endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{watch, Mutex};

/// Lifecycle of the agent's duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Registered with the relay; heartbeat running.
    Registered,
    /// Waiting out the fixed delay before a full restart.
    Reconnecting,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Session event types.
#[derive(Clone, Debug)]
pub enum SessionEventType {
    Connected,
    Registered,
    Disconnected,
    HeartbeatFailed,
    ReconnectAttempt,
}

impl SessionEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Registered => "registered",
            Self::Disconnected => "disconnected",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::ReconnectAttempt => "reconnect_attempt",
        }
    }
}

/// A session lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct SessionEvent {
    pub timestamp: Instant,
    pub event_type: SessionEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_SESSION_EVENTS: usize = 50;

/// Agent statistics: atomics for hot-path counters, `Mutex` only for the
/// event log and the registered id (cold path).
pub struct AgentStats {
    state: watch::Sender<SessionState>,
    pub reconnects: AtomicU64,
    pub requests_handled: AtomicU64,
    pub local_failures: AtomicU64,
    pub jar_size: AtomicUsize,
    pub registered_id: Mutex<Option<String>>,
    pub events: Mutex<VecDeque<SessionEvent>>,
}

impl AgentStats {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            state,
            reconnects: AtomicU64::new(0),
            requests_handled: AtomicU64::new(0),
            local_failures: AtomicU64::new(0),
            jar_size: AtomicUsize::new(0),
            registered_id: Mutex::new(None),
            events: Mutex::new(VecDeque::with_capacity(MAX_SESSION_EVENTS)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Watch state transitions (used by tests and startup code to wait for
    /// registration).
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Push a session event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: SessionEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_SESSION_EVENTS {
            events.pop_front();
        }
        events.push_back(SessionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}
