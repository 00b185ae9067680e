//! Cooperative polling agent contract.

use super::error::Result;

// ---------------------------------------------------------------------------
// TickAgent
// ---------------------------------------------------------------------------

/// A unit of cooperative work driven by an external loop.
///
/// `tick` must be non-blocking and perform a bounded amount of work per
/// call. The return value is the number of items processed; the driver uses
/// zero as the signal to back off via its idle strategy.
///
/// Returning `Err` is terminal: the driver stops ticking and drops the
/// agent. Agents signal normal termination with
/// [`FlowLayError::AgentTerminated`](super::FlowLayError::AgentTerminated).
pub trait TickAgent: Send {
    // ---
    fn tick(&mut self) -> Result<usize>;

    /// Name used in driver log lines.
    fn role_name(&self) -> &str {
        "agent"
    }
}
