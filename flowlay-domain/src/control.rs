//! Control-plane message vocabulary.
//!
//! These are the logical messages exchanged on the rendezvous control
//! channel before and during a session. The wire encoding is owned by the
//! transport layer; serde derives are provided so a transport can encode
//! them however it frames its control stream.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DisconnectReason
// ---------------------------------------------------------------------------

/// Why a `Disconnect` was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    // ---
    /// Application asked for an orderly close.
    Requested,

    /// Peer stopped heartbeating and the watchdog tore the session down.
    LivenessTimeout,

    /// Underlying transport reported permanent closure.
    TransportClosed,
}

// ---------------------------------------------------------------------------
// ControlMessage
// ---------------------------------------------------------------------------

/// One message on the control channel.
///
/// Stream ids are transport-level identifiers allocated by each endpoint
/// for its own inbound direction; session ids are allocated exactly once,
/// by the endpoint that accepts the connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    // ---
    /// Client → server: open a session. `requester_stream_id` is the stream
    /// the client listens on; the server publishes session data there.
    ConnectRequest { requester_stream_id: i32 },

    /// Server → client: session accepted. `peer_stream_id` is the stream
    /// the server listens on; the client publishes session data there.
    ConnectAck { session_id: u64, peer_stream_id: i32 },

    /// Periodic liveness signal, either direction.
    Heartbeat { session_id: u64, timestamp_ms: u64 },

    /// Orderly or forced session teardown, either direction.
    Disconnect {
        session_id: u64,
        reason: DisconnectReason,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
