//! Transport collaborator contracts.
//!
//! The engine never touches wire framing, delivery, or retransmission; it
//! consumes the transport through these traits. A real UDP transport and
//! the in-process simulator both implement them.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::control::ControlMessage;
use super::error::Result;

// ---------------------------------------------------------------------------
// OfferOutcome
// ---------------------------------------------------------------------------

/// Result of a single non-blocking publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    // ---
    /// Buffer taken; the transport owns delivery from here.
    Accepted,

    /// Transient: flow control window is full. Re-offer the identical
    /// buffer; the transport guarantees this is safe.
    BackPressured,

    /// Sink is permanently closed.
    Closed,

    /// Transport-internal administrative action. The engine treats this as
    /// fatal to the sink, same as [`OfferOutcome::Closed`].
    AdminAction,
}

// ---------------------------------------------------------------------------
// OutboundSink
// ---------------------------------------------------------------------------

/// Single-writer publish primitive.
///
/// `offer` must be non-blocking and must return promptly. The write
/// sequencer guarantees only one logical stream drains through a sink at a
/// time, so implementations need not serialize callers themselves.
pub trait OutboundSink: Send + Sync {
    // ---
    fn offer(&self, buf: &Bytes) -> OfferOutcome;
}

// ---------------------------------------------------------------------------
// Fragments and polling
// ---------------------------------------------------------------------------

/// Transport header metadata carried alongside each fragment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    // ---
    /// Byte offset of this fragment within the transport term/stream.
    pub offset: u64,

    /// Payload length in bytes.
    pub length: usize,

    /// Absolute stream position after this fragment.
    pub position: u64,
}

// ---

/// One transport-delivered unit: opaque payload plus header metadata.
///
/// Borrowed: constructed per poll callback, never retained. A mapper that
/// needs the bytes beyond the callback must copy them out.
#[derive(Debug)]
pub struct Fragment<'a> {
    // ---
    pub payload: &'a [u8],
    pub header: FragmentHeader,
}

// ---

/// Handler verdict for each polled fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    // ---
    /// Keep polling up to the limit.
    Continue,

    /// Stop this poll call immediately; remaining fragments wait.
    Abort,
}

// ---

/// Poll-driven fragment source.
///
/// `poll` invokes `handler` synchronously, at most `limit` times, and
/// returns the number of fragments handled. It must be non-blocking.
pub trait PollSource: Send {
    // ---
    fn poll(
        &mut self,
        handler: &mut dyn FnMut(Fragment<'_>) -> PollControl,
        limit: usize,
    ) -> usize;

    /// Whether the source is permanently closed (no more fragments ever).
    fn is_closed(&self) -> bool;

    /// Release the source. Called by an owner during disposal; polling a
    /// closed source returns zero.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// FragmentMapper
// ---------------------------------------------------------------------------

/// Pluggable decoder from raw fragments to application items.
///
/// `Ok(None)` means the fragment was filtered and consumes no demand.
/// `Err` aborts the current poll tick and terminates the inbound stream on
/// the next tick.
pub trait FragmentMapper: Send {
    // ---
    type Item: Send + 'static;

    fn map(&mut self, fragment: Fragment<'_>) -> Result<Option<Self::Item>>;
}

// ---

/// Identity mapper: copies each payload into an owned [`Bytes`].
#[derive(Debug, Default)]
pub struct BytesMapper;

// ---

impl FragmentMapper for BytesMapper {
    // ---
    type Item = Bytes;

    fn map(&mut self, fragment: Fragment<'_>) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::copy_from_slice(fragment.payload)))
    }
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

/// Outbound half of the rendezvous control channel.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    // ---
    async fn send(&self, msg: ControlMessage) -> Result<()>;
}

// ---

/// Inbound half: the transport delivers decoded control messages here and
/// the engine's dispatcher consumes them.
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlMessage>;

// ---------------------------------------------------------------------------
// TransportResources
// ---------------------------------------------------------------------------

/// Factory for per-session data paths, keyed by stream id.
///
/// The connector calls this once per bound session: one sink toward the
/// peer's inbound stream, one source on the local inbound stream.
#[async_trait]
pub trait TransportResources: Send + Sync {
    // ---
    async fn open_sink(&self, stream_id: i32) -> Result<Box<dyn OutboundSink>>;

    async fn open_source(&self, stream_id: i32) -> Result<Box<dyn PollSource>>;
}
