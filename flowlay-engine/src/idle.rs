//! Bounded backoff for busy loops.

use std::time::Duration;

// ---------------------------------------------------------------------------
// IdleStrategy
// ---------------------------------------------------------------------------

/// Escalating idle: spin → yield → sleep.
///
/// Used wherever the engine must retry a non-blocking primitive without
/// starving the rest of the system: the sequencer's back-pressure retry and
/// the agent driver's no-work path. The first [`SPIN_LIMIT`] idles are CPU
/// spins, the next [`YIELD_LIMIT`] are task yields, and after that each
/// idle parks for [`PARK`]. `reset` re-arms the ladder once work resumes.
#[derive(Debug, Default)]
pub struct IdleStrategy {
    // ---
    count: u32,
}

// ---

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 64;
const PARK: Duration = Duration::from_millis(1);

// ---

impl IdleStrategy {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Idle once at the current escalation level.
    pub async fn idle(&mut self) {
        // ---
        if self.count < SPIN_LIMIT {
            self.count += 1;
            std::hint::spin_loop();
        } else if self.count < SPIN_LIMIT + YIELD_LIMIT {
            self.count += 1;
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(PARK).await;
        }
    }

    // ---

    /// Re-arm after useful work.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
