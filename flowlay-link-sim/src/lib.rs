//! In-process mock transport for Flowlay unit and integration testing.
//!
//! [`SimMedium`] implements the data plane with bounded in-memory pipes
//! keyed by stream id; [`control_pair`] provides the crossed control
//! channel. Together they stand in for a real transport so engine tests
//! run a full client/server topology inside one process:
//!
//! ```rust
//! use flowlay_link_sim::{SimConfig, SimEndpoint, SimMedium};
//!
//! let medium = SimMedium::new(SimConfig::default());
//! let client_side = SimEndpoint::new(medium.clone());
//! let server_side = SimEndpoint::new(medium);
//! ```

mod config;
mod control;
mod medium;

// --- public API
pub use config::SimConfig;
pub use control::{control_pair, SimControlChannel};
pub use medium::{SimEndpoint, SimMedium, SimSink, SimSource};
