//! Core traits and types for the Flowlay session engine.
//!
//! This crate defines the vocabulary of the system. The engine and every
//! transport implementation depend on `flowlay-domain` and speak its types.
//! No engine implementations live here.
//!
//! # Structure
//!
//! - [`error`]     — [`FlowLayError`] and [`Result<T>`] alias
//! - [`control`]   — [`ControlMessage`] handshake/liveness vocabulary
//! - [`transport`] — [`OutboundSink`], [`PollSource`], [`ControlChannel`],
//!   [`FragmentMapper`] collaborator traits
//! - [`demand`]    — [`DemandCounter`] saturating demand accounting
//! - [`agent`]     — [`TickAgent`] cooperative work contract

mod agent;
mod control;
mod demand;
mod error;
mod transport;

// --- error
pub use error::{FlowLayError, Result};

// --- control
pub use control::{ControlMessage, DisconnectReason};

// --- transport
pub use transport::{
    // ---
    BytesMapper,
    ControlChannel,
    ControlReceiver,
    Fragment,
    FragmentHeader,
    FragmentMapper,
    OfferOutcome,
    OutboundSink,
    PollControl,
    PollSource,
    TransportResources,
};

// --- demand
pub use demand::{DemandCounter, UNBOUNDED};

// --- agent
pub use agent::TickAgent;
