use std::time::Duration;

use thiserror::Error;

// ---

/// Error taxonomy for the session engine.
///
/// Variants are `Clone` so the same failure can be delivered to every
/// queued completion when the sink closes permanently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowLayError {
    // ---
    /// Sink or poll source is permanently unavailable.
    /// Fatal to the affected stream or session.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Connect attempt exceeded its deadline. Fatal to that attempt only.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Peer refused the connect request, or the control channel failed
    /// mid-handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Heartbeat breach. Drives session teardown; only surfaced to a
    /// caller that is awaiting the session.
    #[error("session {0} liveness timeout")]
    LivenessTimeout(u64),

    /// Second subscribe attempt while a consumer is active. Fails the
    /// offending subscriber only.
    #[error("inbound already has an active subscriber")]
    DuplicateSubscription,

    /// Fragment mapper failed. Aborts the current poll tick; delivered as
    /// the terminal error on the next tick.
    #[error("fragment decode failed: {0}")]
    Decode(String),

    /// Component was disposed while work was still pending.
    #[error("disposed")]
    Disposed,

    /// Watchdog already holds a record under this session id.
    #[error("session {0} is already tracked")]
    AlreadyTracked(u64),

    /// A cooperative agent has reached a terminal state and must be
    /// removed from its driver loop.
    #[error("agent terminated: {0}")]
    AgentTerminated(String),
}

// ---

pub type Result<T> = std::result::Result<T, FlowLayError>;
