//! [`InboundAgent`]: bridges a poll-driven fragment source to a single
//! demand-bounded consumer.
//!
//! # Design
//!
//! The agent side implements [`TickAgent`] and is driven by the external
//! scheduler loop; each tick polls the source for at most
//! `min(outstanding demand, FRAGMENT_LIMIT)` fragments and maps them
//! through the pluggable [`FragmentMapper`]. A consumer that requests
//! `u64::MAX` flips the bridge onto the unbounded fast path, which skips
//! demand accounting entirely.
//!
//! The subscriber side is the cheap-clone [`InboundHandle`]. Exactly one
//! consumer may be active: the consumer slot is swapped with
//! compare-and-set semantics under a short mutex, and swapping it to the
//! terminal state is the only way delivery ever stops. A fragment arriving
//! after termination is logged and dropped, never delivered.
//!
//! Consumer callbacks run on the poll agent's tick with the slot lock
//! released, so a consumer may call [`InboundSubscription::cancel`] or
//! `request` from inside its own `on_next`. A termination that races a
//! tick parks its terminal signal; the agent delivers it once the poll
//! pass ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ---

use tokio::sync::mpsc;

// ---

use flowlay_domain::{
    //
    DemandCounter,
    FlowLayError,
    FragmentMapper,
    PollControl,
    PollSource,
    Result,
    TickAgent,
    UNBOUNDED,
};

// ---

use super::heartbeat::ActivityClock;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on fragments polled per tick, bounding work per call.
pub const FRAGMENT_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// InboundConsumer
// ---------------------------------------------------------------------------

/// Receiver of decoded items. Exactly one terminal call (`on_error` or
/// `on_complete`) is made per consumer lifetime, never both, never
/// followed by further items.
pub trait InboundConsumer<T>: Send {
    // ---
    fn on_next(&mut self, item: T);

    fn on_error(&mut self, err: FlowLayError);

    fn on_complete(&mut self);
}

// ---------------------------------------------------------------------------
// Consumer slot
// ---------------------------------------------------------------------------

/// The one terminal call a consumer receives.
enum Terminal {
    // ---
    /// Cancelled: `on_complete`.
    Complete,

    /// Failed or disposed: `on_error`.
    Error(FlowLayError),
}

// ---

impl Terminal {
    // ---
    fn deliver<T>(self, consumer: &mut dyn InboundConsumer<T>) {
        match self {
            Terminal::Complete => consumer.on_complete(),
            Terminal::Error(err) => consumer.on_error(err),
        }
    }
}

// ---

enum Slot<T> {
    // ---
    /// No consumer yet.
    Empty,

    /// Live consumer receiving items.
    Active(Box<dyn InboundConsumer<T>>),

    /// Consumer leased to the poll agent for the current tick, so
    /// callbacks run without the slot lock held.
    Delivering,

    /// Terminal sentinel: delivery has stopped forever. Holds the signal
    /// still owed to a leased consumer when termination raced a tick.
    Terminated(Option<Terminal>),
}

// ---

struct Shared<T> {
    // ---
    slot: Mutex<Slot<T>>,
    demand: DemandCounter,
    fast_path: AtomicBool,
    activity: Arc<ActivityClock>,
}

// ---

impl<T> Shared<T> {
    // ---
    fn is_terminated(&self) -> bool {
        matches!(*self.slot.lock().unwrap(), Slot::Terminated(_))
    }

    // ---

    /// Swap the slot to [`Slot::Terminated`]. When the consumer is parked
    /// in the slot it comes back with `signal` for the caller to deliver.
    /// When it is leased to a mid-tick delivery the signal is parked in
    /// the slot instead and the poll agent delivers it after its pass.
    /// This is the single swap point between the poll agent and a
    /// cancelling/disposing caller.
    fn terminate(&self, signal: Terminal) -> Option<(Box<dyn InboundConsumer<T>>, Terminal)> {
        // ---
        let mut slot = self.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Terminated(None)) {
            Slot::Active(consumer) => Some((consumer, signal)),
            Slot::Delivering => {
                *slot = Slot::Terminated(Some(signal));
                None
            }
            Slot::Empty => None,
            Slot::Terminated(pending) => {
                *slot = Slot::Terminated(pending);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InboundHandle
// ---------------------------------------------------------------------------

/// Subscriber-side handle to an inbound bridge.
pub struct InboundHandle<T> {
    // ---
    shared: Arc<Shared<T>>,
}

// ---

impl<T> Clone for InboundHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// ---

impl<T: Send + 'static> InboundHandle<T> {
    // ---
    /// Install `consumer` as the single active subscriber.
    ///
    /// A second attempt while one is active (or after termination) fails
    /// that attempt only: the offending consumer receives
    /// [`FlowLayError::DuplicateSubscription`] as its terminal error and
    /// the first subscriber is undisturbed.
    pub fn subscribe(
        &self,
        consumer: Box<dyn InboundConsumer<T>>,
    ) -> Result<InboundSubscription<T>> {
        // ---
        let mut consumer = consumer;
        {
            let mut slot = self.shared.slot.lock().unwrap();
            if let Slot::Empty = *slot {
                *slot = Slot::Active(consumer);
                return Ok(InboundSubscription {
                    shared: Arc::clone(&self.shared),
                });
            }
        }
        consumer.on_error(FlowLayError::DuplicateSubscription);
        Err(FlowLayError::DuplicateSubscription)
    }

    // ---

    /// Terminate delivery with a disposal error to the active consumer,
    /// if any. Idempotent.
    pub fn dispose(&self) {
        self.dispose_with(FlowLayError::Disposed);
    }

    // ---

    /// Terminate delivery with a specific terminal error, so the consumer
    /// learns why the stream died (liveness breach rather than a plain
    /// dispose, for instance). Idempotent.
    pub fn dispose_with(&self, err: FlowLayError) {
        // ---
        if let Some((mut consumer, signal)) = self.shared.terminate(Terminal::Error(err)) {
            signal.deliver(consumer.as_mut());
        }
    }
}

// ---------------------------------------------------------------------------
// InboundSubscription
// ---------------------------------------------------------------------------

/// Demand/cancellation handle returned from a successful subscribe.
pub struct InboundSubscription<T> {
    // ---
    shared: Arc<Shared<T>>,
}

// ---

impl<T> InboundSubscription<T> {
    // ---
    /// Authorize `n` more items. `u64::MAX` switches permanently to the
    /// unbounded fast path. `request(0)` is a contract violation: logged
    /// and ignored, the counter is untouched.
    pub fn request(&self, n: u64) {
        // ---
        if n == 0 {
            tracing::warn!("request(0) violates the demand contract, ignoring");
            return;
        }
        if self.shared.fast_path.load(Ordering::Acquire) {
            return;
        }
        if n == UNBOUNDED {
            self.shared.demand.set_unbounded();
            self.shared.fast_path.store(true, Ordering::Release);
            return;
        }
        self.shared.demand.add(n);
    }

    // ---

    /// Stop delivery. The active consumer receives `on_complete`; further
    /// cancels are no-ops.
    pub fn cancel(&self) {
        // ---
        if let Some((mut consumer, signal)) = self.shared.terminate(Terminal::Complete) {
            signal.deliver(consumer.as_mut());
            tracing::debug!("inbound consumer cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// InboundAgent
// ---------------------------------------------------------------------------

/// Agent side of the bridge: owns the poll source and mapper, driven by
/// repeated non-blocking ticks.
pub struct InboundAgent<M: FragmentMapper> {
    // ---
    source: Box<dyn PollSource>,
    owns_source: bool,
    mapper: M,
    shared: Arc<Shared<M::Item>>,
    /// Decode failure recorded mid-poll, delivered on the next tick.
    pending_err: Option<FlowLayError>,
    role: String,
}

// ---

impl<M: FragmentMapper> InboundAgent<M> {
    // ---
    /// Build the bridge. `owns_source` controls whether disposal closes
    /// the source. The activity clock is touched on every polled fragment.
    pub fn new(
        source: Box<dyn PollSource>,
        mapper: M,
        owns_source: bool,
        activity: Arc<ActivityClock>,
        stream_id: i32,
    ) -> (Self, InboundHandle<M::Item>) {
        // ---
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Empty),
            demand: DemandCounter::new(),
            fast_path: AtomicBool::new(false),
            activity,
        });

        let agent = Self {
            source,
            owns_source,
            mapper,
            shared: Arc::clone(&shared),
            pending_err: None,
            role: format!("inbound:{stream_id}"),
        };
        let handle = InboundHandle { shared };
        (agent, handle)
    }

    // ---

    /// Terminate delivery with `err` and report agent termination.
    fn terminate_with(&self, err: FlowLayError) -> FlowLayError {
        // ---
        let msg = err.to_string();
        if let Some((mut consumer, signal)) = self.shared.terminate(Terminal::Error(err)) {
            signal.deliver(consumer.as_mut());
        }
        FlowLayError::AgentTerminated(msg)
    }
}

// ---

impl<M: FragmentMapper> TickAgent for InboundAgent<M> {
    // ---
    fn tick(&mut self) -> Result<usize> {
        // ---
        if self.shared.is_terminated() {
            return Err(FlowLayError::AgentTerminated("inbound cancelled".into()));
        }

        if let Some(err) = self.pending_err.take() {
            return Err(self.terminate_with(err));
        }

        if self.source.is_closed() {
            return Err(
                self.terminate_with(FlowLayError::TransportClosed("poll source closed".into()))
            );
        }

        let fast = self.shared.fast_path.load(Ordering::Acquire);
        let limit = if fast {
            FRAGMENT_LIMIT
        } else {
            self.shared.demand.get().min(FRAGMENT_LIMIT as u64) as usize
        };
        if limit == 0 {
            return Ok(0);
        }

        // Lease the consumer out of the slot so its callbacks run without
        // the slot lock held; it may cancel from inside `on_next`.
        let mut consumer = {
            let mut slot = self.shared.slot.lock().unwrap();
            match std::mem::replace(&mut *slot, Slot::Delivering) {
                Slot::Active(consumer) => consumer,
                other => {
                    *slot = other;
                    return Ok(0);
                }
            }
        };

        let shared = &self.shared;
        let mapper = &mut self.mapper;
        let mut produced: u64 = 0;
        let mut decode_err: Option<FlowLayError> = None;

        let count = self.source.poll(
            &mut |fragment| {
                // ---
                shared.activity.touch();

                if shared.is_terminated() {
                    tracing::warn!(
                        length = fragment.header.length,
                        "dropping fragment delivered after inbound termination"
                    );
                    return PollControl::Abort;
                }

                match mapper.map(fragment) {
                    Ok(Some(item)) => {
                        consumer.on_next(item);
                        produced += 1;
                        PollControl::Continue
                    }
                    // Filtered fragment: consumes no demand.
                    Ok(None) => PollControl::Continue,
                    Err(e) => {
                        decode_err = Some(e);
                        PollControl::Abort
                    }
                }
            },
            limit,
        );

        // Park the consumer again, or deliver the terminal signal a
        // racing cancel/dispose left while the consumer was leased out.
        {
            let mut slot = self.shared.slot.lock().unwrap();
            match std::mem::replace(&mut *slot, Slot::Terminated(None)) {
                Slot::Delivering => *slot = Slot::Active(consumer),
                Slot::Terminated(pending) => {
                    drop(slot);
                    if let Some(signal) = pending {
                        signal.deliver(consumer.as_mut());
                    }
                }
                other => *slot = other,
            }
        }

        if produced > 0 && !fast {
            self.shared.demand.produced(produced);
        }
        self.pending_err = decode_err;

        Ok(count)
    }

    // ---

    fn role_name(&self) -> &str {
        &self.role
    }
}

// ---

impl<M: FragmentMapper> Drop for InboundAgent<M> {
    // ---
    fn drop(&mut self) {
        if self.owns_source {
            self.source.close();
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelConsumer
// ---------------------------------------------------------------------------

/// Consumer adapter forwarding items into an unbounded channel, so
/// applications can `recv().await` instead of implementing
/// [`InboundConsumer`]. Completion is observed as channel closure.
pub struct ChannelConsumer<T> {
    // ---
    tx: mpsc::UnboundedSender<Result<T>>,
}

// ---

/// Build a channel-backed consumer plus its receiving half.
pub fn channel_consumer<T: Send + 'static>(
) -> (ChannelConsumer<T>, mpsc::UnboundedReceiver<Result<T>>) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelConsumer { tx }, rx)
}

// ---

impl<T: Send> InboundConsumer<T> for ChannelConsumer<T> {
    // ---
    fn on_next(&mut self, item: T) {
        if self.tx.send(Ok(item)).is_err() {
            tracing::debug!("inbound receiver dropped, item discarded");
        }
    }

    fn on_error(&mut self, err: FlowLayError) {
        let _ = self.tx.send(Err(err));
    }

    fn on_complete(&mut self) {
        // Dropping the sender closes the channel, which is the completion
        // signal on the receiving side.
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
