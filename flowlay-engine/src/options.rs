//! Engine tunables.

use std::time::Duration;

// ---------------------------------------------------------------------------
// EngineOptions
// ---------------------------------------------------------------------------

/// Timing knobs shared by the connector, watchdog and heartbeat sender.
///
/// The heartbeat interval defaults to a quarter of the liveness timeout so
/// several heartbeats fit inside one timeout window.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    // ---
    /// Deadline for a connect attempt (ConnectRequest → ConnectAck).
    pub connect_timeout: Duration,

    /// Silence after which the watchdog declares a session dead.
    pub heartbeat_timeout: Duration,

    /// Period between outgoing Heartbeat control messages.
    pub heartbeat_interval: Duration,

    /// Watchdog scan period. Teardown fires within
    /// `heartbeat_timeout + watchdog_tick` of the last activity.
    pub watchdog_tick: Duration,
}

// ---

impl Default for EngineOptions {
    // ---
    fn default() -> Self {
        let heartbeat_timeout = Duration::from_secs(5);
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout,
            heartbeat_interval: heartbeat_timeout / 4,
            watchdog_tick: Duration::from_millis(100),
        }
    }
}

// ---

impl EngineOptions {
    // ---
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    // ---

    /// Set the liveness timeout and rescale the heartbeat interval to a
    /// quarter of it.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self.heartbeat_interval = timeout / 4;
        self
    }

    // ---

    pub fn with_watchdog_tick(mut self, tick: Duration) -> Self {
        self.watchdog_tick = tick;
        self
    }
}
