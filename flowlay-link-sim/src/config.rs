//! Simulator tunables.

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Knobs for the in-process medium.
#[derive(Debug, Clone)]
pub struct SimConfig {
    // ---
    /// Buffers a pipe holds before it starts answering `BackPressured`.
    pub pipe_capacity: usize,
}

// ---

impl Default for SimConfig {
    fn default() -> Self {
        Self { pipe_capacity: 64 }
    }
}

// ---

impl SimConfig {
    // ---
    /// A tiny capacity, for tests that want back-pressure quickly.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }
}
