//! The shared in-process medium: a bag of stream pipes.
//!
//! A [`SimMedium`] holds one bounded FIFO pipe per stream id. Sinks opened
//! on a stream push into its pipe; sources opened on the same stream pop
//! from it, so two endpoints sharing a medium see each other's writes. A
//! full pipe answers `BackPressured`, a closed one answers `Closed`, the
//! two transport behaviors the engine must absorb.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

// ---

use bytes::Bytes;

// ---

use flowlay_domain::{
    //
    Fragment,
    FragmentHeader,
    OfferOutcome,
    OutboundSink,
    PollControl,
    PollSource,
    Result,
    TransportResources,
};

// ---

use super::config::SimConfig;

// ---------------------------------------------------------------------------
// SimPipe
// ---------------------------------------------------------------------------

struct PipeState {
    // ---
    queue: VecDeque<Bytes>,
    /// Bytes popped so far; the next fragment's header offset.
    consumed: u64,
    closed: bool,
}

// ---

pub(crate) struct SimPipe {
    // ---
    capacity: usize,
    state: Mutex<PipeState>,
}

// ---

impl SimPipe {
    // ---
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                consumed: 0,
                closed: false,
            }),
        }
    }

    // ---

    fn offer(&self, buf: &Bytes) -> OfferOutcome {
        // ---
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return OfferOutcome::Closed;
        }
        if state.queue.len() >= self.capacity {
            return OfferOutcome::BackPressured;
        }
        state.queue.push_back(buf.clone());
        OfferOutcome::Accepted
    }

    // ---

    fn poll(
        &self,
        handler: &mut dyn FnMut(Fragment<'_>) -> PollControl,
        limit: usize,
    ) -> usize {
        // ---
        let mut count = 0;
        while count < limit {
            let (payload, offset) = {
                let mut state = self.state.lock().unwrap();
                let Some(payload) = state.queue.pop_front() else {
                    break;
                };
                let offset = state.consumed;
                state.consumed += payload.len() as u64;
                (payload, offset)
            };

            let header = FragmentHeader {
                offset,
                length: payload.len(),
                position: offset + payload.len() as u64,
            };
            count += 1;
            // Handler runs outside the pipe lock.
            if handler(Fragment {
                payload: &payload,
                header,
            }) == PollControl::Abort
            {
                break;
            }
        }
        count
    }

    // ---

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    // ---

    /// Closed for good: no producer may add and nothing is left to drain.
    fn is_drained_and_closed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed && state.queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SimSink / SimSource
// ---------------------------------------------------------------------------

pub struct SimSink {
    // ---
    pipe: Arc<SimPipe>,
}

// ---

impl OutboundSink for SimSink {
    // ---
    fn offer(&self, buf: &Bytes) -> OfferOutcome {
        self.pipe.offer(buf)
    }
}

// ---

pub struct SimSource {
    // ---
    pipe: Arc<SimPipe>,
}

// ---

impl PollSource for SimSource {
    // ---
    fn poll(
        &mut self,
        handler: &mut dyn FnMut(Fragment<'_>) -> PollControl,
        limit: usize,
    ) -> usize {
        self.pipe.poll(handler, limit)
    }

    fn is_closed(&self) -> bool {
        self.pipe.is_drained_and_closed()
    }

    fn close(&mut self) {
        self.pipe.close();
    }
}

// ---------------------------------------------------------------------------
// SimMedium
// ---------------------------------------------------------------------------

/// One shared medium per test topology. Cheap to clone via `Arc`; both
/// endpoints open sinks and sources against the same pipe map.
pub struct SimMedium {
    // ---
    capacity: usize,
    pipes: Mutex<HashMap<i32, Arc<SimPipe>>>,
}

// ---

impl SimMedium {
    // ---
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            capacity: config.pipe_capacity,
            pipes: Mutex::new(HashMap::new()),
        })
    }

    // ---

    fn pipe(&self, stream_id: i32) -> Arc<SimPipe> {
        // ---
        let mut pipes = self.pipes.lock().unwrap();
        Arc::clone(
            pipes
                .entry(stream_id)
                .or_insert_with(|| Arc::new(SimPipe::new(self.capacity))),
        )
    }

    // ---

    pub fn sink(&self, stream_id: i32) -> SimSink {
        SimSink {
            pipe: self.pipe(stream_id),
        }
    }

    // ---

    pub fn source(&self, stream_id: i32) -> SimSource {
        SimSource {
            pipe: self.pipe(stream_id),
        }
    }

    // ---

    /// Sever one stream: later offers answer `Closed`, the source drains
    /// what is queued and then reports closure.
    pub fn sever(&self, stream_id: i32) {
        self.pipe(stream_id).close();
    }
}

// ---

/// Resource factory over a shared medium. Each endpoint of a topology
/// holds one.
#[derive(Clone)]
pub struct SimEndpoint {
    // ---
    medium: Arc<SimMedium>,
}

// ---

impl SimEndpoint {
    // ---
    pub fn new(medium: Arc<SimMedium>) -> Self {
        Self { medium }
    }
}

// ---

#[async_trait::async_trait]
impl TransportResources for SimEndpoint {
    // ---
    async fn open_sink(&self, stream_id: i32) -> Result<Box<dyn OutboundSink>> {
        tracing::debug!(stream_id, "sim: opening sink");
        Ok(Box::new(self.medium.sink(stream_id)))
    }

    async fn open_source(&self, stream_id: i32) -> Result<Box<dyn PollSource>> {
        tracing::debug!(stream_id, "sim: opening source");
        Ok(Box::new(self.medium.source(stream_id)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
