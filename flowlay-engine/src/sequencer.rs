//! [`WriteSequencer`]: serializes many logical streams onto one sink.
//!
//! # Design
//!
//! Callers submit buffer sources from any task and get back a
//! [`StreamCompletion`] that resolves when that specific stream has fully
//! drained. A single dedicated drain task owns the sink and processes the
//! queue strictly in submission order, so buffers from different streams
//! never interleave on the wire.
//!
//! Back-pressure from the sink is absorbed by re-offering the identical
//! buffer under the [`IdleStrategy`] ladder: no loss, no reordering, no
//! unbounded spin. A permanently closed sink fails the current stream and
//! every stream queued behind it with the same error; a source-side error
//! fails only its own stream and the queue keeps moving.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};

// ---

use flowlay_domain::{FlowLayError, OfferOutcome, OutboundSink, Result};

// ---

use super::idle::IdleStrategy;

// ---------------------------------------------------------------------------
// BufferSource
// ---------------------------------------------------------------------------

/// A lazy, finite-or-infinite sequence of byte buffers.
///
/// The drain task pulls with unlimited internal demand: it awaits
/// `next_buf` for each buffer in turn. `None` completes the stream; an
/// `Err` item aborts it (reported through its completion) without touching
/// sibling streams.
#[async_trait]
pub trait BufferSource: Send {
    // ---
    async fn next_buf(&mut self) -> Option<Result<Bytes>>;
}

// ---

/// Finite source over buffers that are already in memory.
#[derive(Debug, Default)]
pub struct StaticBuffers {
    // ---
    bufs: VecDeque<Bytes>,
}

// ---

impl StaticBuffers {
    // ---
    pub fn new<I>(bufs: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        Self {
            bufs: bufs.into_iter().collect(),
        }
    }
}

// ---

#[async_trait]
impl BufferSource for StaticBuffers {
    // ---
    async fn next_buf(&mut self) -> Option<Result<Bytes>> {
        self.bufs.pop_front().map(Ok)
    }
}

// ---

/// Channel-fed source: the producer side keeps sending until it drops the
/// sender, which completes the stream.
#[async_trait]
impl BufferSource for mpsc::Receiver<Bytes> {
    // ---
    async fn next_buf(&mut self) -> Option<Result<Bytes>> {
        self.recv().await.map(Ok)
    }
}

// ---

#[async_trait]
impl BufferSource for mpsc::UnboundedReceiver<Bytes> {
    // ---
    async fn next_buf(&mut self) -> Option<Result<Bytes>> {
        self.recv().await.map(Ok)
    }
}

// ---------------------------------------------------------------------------
// StreamCompletion
// ---------------------------------------------------------------------------

/// Resolves when one submitted stream has fully drained, or failed.
#[derive(Debug)]
pub struct StreamCompletion {
    // ---
    rx: oneshot::Receiver<Result<()>>,
}

// ---

impl StreamCompletion {
    // ---
    pub async fn wait(self) -> Result<()> {
        // A dropped sender means the drain task went away mid-stream,
        // which only happens on disposal.
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FlowLayError::Disposed),
        }
    }
}

// ---------------------------------------------------------------------------
// WriteSequencer
// ---------------------------------------------------------------------------

struct PendingStream {
    // ---
    source: Box<dyn BufferSource>,
    done: oneshot::Sender<Result<()>>,
}

// ---

/// Multiplexes arbitrarily many independently-produced streams onto one
/// [`OutboundSink`], one at a time, in submission order.
pub struct WriteSequencer {
    // ---
    queue_tx: mpsc::UnboundedSender<PendingStream>,
    disposed: Arc<AtomicBool>,
    dispose_notify: Arc<Notify>,
}

// ---

impl WriteSequencer {
    // ---
    /// Take ownership of `sink` and spawn the drain task. The sink is
    /// released when the task exits (disposal, or the sequencer and all
    /// queued streams are gone).
    pub fn new(sink: Box<dyn OutboundSink>) -> Self {
        // ---
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let disposed = Arc::new(AtomicBool::new(false));
        let dispose_notify = Arc::new(Notify::new());

        tokio::spawn(drain_loop(
            queue_rx,
            sink,
            Arc::clone(&disposed),
            Arc::clone(&dispose_notify),
        ));

        Self {
            queue_tx,
            disposed,
            dispose_notify,
        }
    }

    // ---

    /// Queue a stream for draining. Returns immediately; the completion
    /// resolves when this stream's last buffer has been accepted by the
    /// sink, or fails with this stream's error.
    pub fn submit(&self, source: impl BufferSource + 'static) -> StreamCompletion {
        // ---
        let (done, rx) = oneshot::channel();

        if self.disposed.load(Ordering::Acquire) {
            let _ = done.send(Err(FlowLayError::Disposed));
            return StreamCompletion { rx };
        }

        let pending = PendingStream {
            source: Box::new(source),
            done,
        };
        if let Err(mpsc::error::SendError(pending)) = self.queue_tx.send(pending) {
            // Drain task already gone, racing with dispose.
            let _ = pending.done.send(Err(FlowLayError::Disposed));
        }

        StreamCompletion { rx }
    }

    // ---

    /// Stop draining. The current stream and every queued completion fail
    /// with [`FlowLayError::Disposed`]; no further bytes reach the sink.
    /// Idempotent.
    pub fn dispose(&self) {
        // ---
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("write sequencer disposed, failing queued streams");
        self.dispose_notify.notify_one();
    }

    // ---

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Drain task
// ---------------------------------------------------------------------------

async fn drain_loop(
    mut queue_rx: mpsc::UnboundedReceiver<PendingStream>,
    sink: Box<dyn OutboundSink>,
    disposed: Arc<AtomicBool>,
    dispose_notify: Arc<Notify>,
) {
    // ---
    // Once the sink reports permanent closure, every later stream fails
    // immediately with the same error, undrained.
    let mut sink_error: Option<FlowLayError> = None;

    loop {
        let pending = tokio::select! {
            biased;
            _ = dispose_notify.notified() => break,
            next = queue_rx.recv() => match next {
                Some(pending) => pending,
                None => return, // sequencer dropped, queue fully drained
            },
        };

        if disposed.load(Ordering::Acquire) {
            let _ = pending.done.send(Err(FlowLayError::Disposed));
            break;
        }

        if let Some(err) = &sink_error {
            let _ = pending.done.send(Err(err.clone()));
            continue;
        }

        let mut source = pending.source;
        let result = drain_one(source.as_mut(), sink.as_ref(), &disposed, &dispose_notify).await;

        if let Err(FlowLayError::TransportClosed(_)) = &result {
            sink_error = result.as_ref().err().cloned();
        }
        let _ = pending.done.send(result);

        if disposed.load(Ordering::Acquire) {
            break;
        }
    }

    // Disposal: fail everything still queued without touching the sink.
    queue_rx.close();
    while let Some(pending) = queue_rx.recv().await {
        let _ = pending.done.send(Err(FlowLayError::Disposed));
    }
}

// ---

/// Drain one stream to completion: pull each buffer and offer it until the
/// sink accepts, backing off on back-pressure without dropping or skipping.
async fn drain_one(
    source: &mut dyn BufferSource,
    sink: &dyn OutboundSink,
    disposed: &AtomicBool,
    dispose_notify: &Notify,
) -> Result<()> {
    // ---
    loop {
        if disposed.load(Ordering::Acquire) {
            return Err(FlowLayError::Disposed);
        }

        // A lazy source may block here indefinitely; disposal must still
        // cut through.
        let buf = tokio::select! {
            biased;
            _ = dispose_notify.notified() => return Err(FlowLayError::Disposed),
            next = source.next_buf() => match next {
                None => return Ok(()),
                Some(Ok(buf)) => buf,
                Some(Err(e)) => return Err(e),
            },
        };

        let mut idle = IdleStrategy::new();
        loop {
            if disposed.load(Ordering::Acquire) {
                return Err(FlowLayError::Disposed);
            }
            match sink.offer(&buf) {
                OfferOutcome::Accepted => break,
                OfferOutcome::BackPressured => idle.idle().await,
                OfferOutcome::Closed => {
                    return Err(FlowLayError::TransportClosed("sink closed".into()));
                }
                OfferOutcome::AdminAction => {
                    return Err(FlowLayError::TransportClosed("sink admin action".into()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
