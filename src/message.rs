// ABOUTME: Wire contract between the gateway, pool, and execution units
// ABOUTME: Request/response envelopes, broadcast events, and socket status types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;

/// Globally unique correlation key for one in-flight request.
///
/// Freshly generated per `send()`, this is the sole key used to match a
/// `ResponseMessage` back to its caller. Random 128-bit IDs keep requests
/// from different callers collision-free without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a fresh collision-resistant request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed request envelope sent to an execution unit.
///
/// `op` is an operation name such as `"ping"`, `"init"`, `"from.select"`,
/// or `"ws.connect"`; `payload` is opaque to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation key, unique among all in-flight requests.
    pub id: RequestId,
    /// Operation name.
    pub op: String,
    /// Operation arguments, if any.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl RequestMessage {
    /// Build a request with a fresh ID.
    #[must_use]
    pub fn new(op: impl Into<String>, payload: Value) -> Self {
        Self {
            id: RequestId::new(),
            op: op.into(),
            payload,
        }
    }
}

/// Response envelope emitted by an execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Correlation key copied from the matching request.
    pub id: RequestId,
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Error description on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseMessage {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn ok(id: RequestId, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data,
            error: None,
        }
    }

    /// Failed response carrying the wire form of `err`.
    #[must_use]
    pub fn err(id: RequestId, err: &GatewayError) -> Self {
        Self {
            id,
            ok: false,
            data: Value::Null,
            error: Some(err.wire_message()),
        }
    }

    /// Convert back into the caller-facing result.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(GatewayError::Backend(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }
}

/// Connection lifecycle of the persistent socket channel.
///
/// Legal transitions: Connecting -> Open -> Closing -> Closed, or
/// Connecting -> Closed on failure. A fresh Connecting always follows Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// Socket handshake in progress.
    Connecting,
    /// Socket established and heartbeating.
    Open,
    /// Close initiated, not yet acknowledged.
    Closing,
    /// No socket.
    Closed,
}

/// Snapshot of the socket channel, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketStatus {
    /// Current lifecycle state.
    pub ready_state: ReadyState,
    /// Consecutive reconnect attempts since the last stable connection.
    pub reconnect_attempts: u32,
    /// Close code from the transport, when the state change came from a close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
    /// Human-readable detail (close reason, error text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SocketStatus {
    /// Status with no close metadata.
    #[must_use]
    pub const fn new(ready_state: ReadyState, reconnect_attempts: u32) -> Self {
        Self {
            ready_state,
            reconnect_attempts,
            close_code: None,
            detail: None,
        }
    }
}

/// Discriminant used to subscribe to one class of broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Auth/session state changed.
    Auth,
    /// Ordinary inbound socket message.
    SocketMessage,
    /// Socket lifecycle transition.
    SocketStatus,
    /// Change-subscription notification.
    Realtime,
    /// A context finished starting up.
    Ready,
}

/// Ephemeral event fanned out across execution contexts and to the host.
///
/// Best-effort delivery: no ordering across contexts, at most once per
/// subscriber per send, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    /// Session snapshot after an auth state change (null on sign-out).
    Auth {
        /// Current session payload, if signed in.
        session: Value,
    },
    /// Ordinary inbound socket message (liveness acks are never forwarded).
    SocketMessage {
        /// Decoded message body.
        data: Value,
    },
    /// Socket lifecycle transition.
    SocketStatus {
        /// Snapshot at the transition.
        status: SocketStatus,
    },
    /// Change notification for one subscription key.
    Realtime {
        /// Subscription key the change belongs to.
        key: String,
        /// Change payload from the backend.
        payload: Value,
    },
    /// A context finished starting up.
    Ready,
}

impl BroadcastEvent {
    /// Discriminant for subscription filtering.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Auth { .. } => EventKind::Auth,
            Self::SocketMessage { .. } => EventKind::SocketMessage,
            Self::SocketStatus { .. } => EventKind::SocketStatus,
            Self::Realtime { .. } => EventKind::Realtime,
            Self::Ready => EventKind::Ready,
        }
    }
}
