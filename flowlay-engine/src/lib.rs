//! Demand-driven session engine over poll-based transports.
//!
//! The engine turns the raw collaborators of `flowlay-domain` (an offer
//! sink, a poll source, a control channel) into live sessions: an ordered
//! write path, a demand-bounded inbound path, heartbeat liveness, and the
//! connect handshake.
//!
//! # Structure
//!
//! - [`sequencer`] — [`WriteSequencer`], FIFO stream multiplexing onto one
//!   sink with back-pressure absorption
//! - [`inbound`]   — [`InboundAgent`]/[`InboundHandle`], the poll-to-demand
//!   bridge
//! - [`heartbeat`] — [`ActivityClock`], [`HeartbeatWatchdog`],
//!   [`HeartbeatSender`]
//! - [`connector`] — [`ControlDispatcher`], [`ClientConnector`],
//!   [`ServerAcceptor`]
//! - [`session`]   — [`Session`], the bound aggregate
//! - [`driver`]    — tick-agent loop with the [`IdleStrategy`] backoff
//! - [`options`]   — [`EngineOptions`] timing knobs

mod connector;
mod driver;
mod heartbeat;
mod idle;
mod inbound;
mod options;
mod sequencer;
mod session;

// --- sequencer
pub use sequencer::{BufferSource, StaticBuffers, StreamCompletion, WriteSequencer};

// --- inbound
pub use inbound::{
    // ---
    channel_consumer,
    ChannelConsumer,
    InboundAgent,
    InboundConsumer,
    InboundHandle,
    InboundSubscription,
    FRAGMENT_LIMIT,
};

// --- heartbeat
pub use heartbeat::{ActivityClock, HeartbeatSender, HeartbeatWatchdog};

// --- connector
pub use connector::{ClientConnector, ControlDispatcher, ServerAcceptor, SessionHooks};

// --- session
pub use session::{Session, SessionBinding, SessionState, SessionSubscription};

// --- driver
pub use driver::{spawn_agent, AgentHandle};

// --- idle / options
pub use idle::IdleStrategy;
pub use options::EngineOptions;
