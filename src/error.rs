// ABOUTME: Error taxonomy for the gateway subsystem
// ABOUTME: Construction, unit-crash, timeout, socket, and retry-exhaustion failures

use thiserror::Error;

/// Errors surfaced by the gateway and its subsystems.
///
/// The taxonomy separates failures that are fatal to construction from
/// failures scoped to a single request, a single execution unit, or the
/// socket channel. Errors local to one request or unit never abort the pool.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A unit, socket, or strategy could not be created. Fatal to `init()`,
    /// never retried automatically.
    #[error("Construction failed: {0}")]
    Construction(String),

    /// A live execution unit signaled a runtime error. All of its in-flight
    /// requests are rejected with this error while the slot enters recovery.
    #[error("Unit {index} crashed: {reason}")]
    UnitCrash {
        /// Pool slot index of the crashed unit.
        index: usize,
        /// Description carried on the unit's fatal signal.
        reason: String,
    },

    /// A request was routed to a slot with no live unit behind it.
    #[error("Unit {0} not available")]
    UnitUnavailable(usize),

    /// A single in-flight request exceeded its deadline. Only that request
    /// fails; the unit is not considered crashed.
    #[error("Request timed out after {0} ms")]
    RequestTimeout(u64),

    /// A slot failed recovery more times than the retry ceiling and is
    /// permanently abandoned. Requests routed to it fail with this error
    /// while the pool keeps operating at reduced capacity.
    #[error("Unit {0} exhausted recovery attempts")]
    ExhaustedRetries(usize),

    /// The remote backend rejected an operation.
    #[error("Backend error: {0}")]
    Backend(String),

    /// An execution unit received an operation name it does not handle.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// An operation payload is missing a required field or has the wrong
    /// shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The socket channel is not in a state that allows the operation.
    #[error("Socket not connected")]
    SocketNotConnected,

    /// Connecting the socket requires an authenticated session token.
    #[error("No active session: {0}")]
    NoSession(String),

    /// The socket transport failed while connecting or in flight.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The pool or gateway was terminated while the request was in flight.
    #[error("Gateway terminated")]
    Terminated,

    /// An operation arrived before `init()` completed or after shutdown.
    #[error("Not initialized")]
    NotInitialized,

    /// Wire payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Collapse into the wire-level error string carried on a
    /// `ResponseMessage`.
    #[must_use]
    pub fn wire_message(&self) -> String {
        self.to_string()
    }

    /// True for errors that only affect a single request.
    #[must_use]
    pub const fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout(_)
                | Self::Backend(_)
                | Self::UnknownOperation(_)
                | Self::InvalidPayload(_)
                | Self::UnitUnavailable(_)
                | Self::ExhaustedRetries(_)
        )
    }
}
