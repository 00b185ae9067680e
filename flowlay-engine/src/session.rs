//! [`Session`]: the live aggregate of one bound connection.
//!
//! A session owns one inbound bridge (poll agent + subscription handle),
//! one write sequencer, a heartbeat sender, and a watchdog registration.
//! All the pieces come apart in `close`, which is idempotent and resolves
//! a watch-based close signal observable by any number of waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ---

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

// ---

use flowlay_domain::{
    //
    BytesMapper,
    ControlChannel,
    ControlMessage,
    DisconnectReason,
    FlowLayError,
    OutboundSink,
    PollSource,
    Result,
};

// ---

use super::connector::{ControlDispatcher, SessionHooks};
use super::driver::{spawn_agent, AgentHandle};
use super::heartbeat::{ActivityClock, HeartbeatSender, HeartbeatWatchdog};
use super::inbound::{channel_consumer, InboundAgent, InboundHandle, InboundSubscription};
use super::options::EngineOptions;
use super::sequencer::{BufferSource, StreamCompletion, WriteSequencer};

// ---------------------------------------------------------------------------
// SessionBinding / SessionState
// ---------------------------------------------------------------------------

/// Identity of a bound session: its id and the stream pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    // ---
    pub session_id: u64,

    /// Stream this endpoint polls for inbound session data.
    pub local_stream_id: i32,

    /// Stream the peer polls; this endpoint's outbound data goes there.
    pub peer_stream_id: i32,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    // ---
    Connecting,
    Active,
    Closing,
    Closed,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything released exactly once, by the first `close`.
struct Teardown {
    // ---
    watchdog: Arc<HeartbeatWatchdog>,
    heartbeat: HeartbeatSender,
    dispatcher: Arc<ControlDispatcher>,
    inbound_agent: AgentHandle,
}

// ---

struct SessionInner {
    // ---
    binding: SessionBinding,
    activity: Arc<ActivityClock>,
    sequencer: WriteSequencer,
    inbound: InboundHandle<Bytes>,
    control: Arc<dyn ControlChannel>,
    state: Mutex<SessionState>,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
    teardown: Mutex<Option<Teardown>>,
}

// ---

/// Cheap-clone handle to one live session.
#[derive(Clone)]
pub struct Session {
    // ---
    inner: Arc<SessionInner>,
}

// ---

impl Session {
    // ---
    /// Assemble a session over an already-negotiated binding: spawn the
    /// inbound poll agent, the write drain task and the heartbeat sender,
    /// then register with the dispatcher and the watchdog.
    pub(crate) async fn bind(
        binding: SessionBinding,
        sink: Box<dyn OutboundSink>,
        source: Box<dyn PollSource>,
        control: Arc<dyn ControlChannel>,
        dispatcher: Arc<ControlDispatcher>,
        watchdog: Arc<HeartbeatWatchdog>,
        options: &EngineOptions,
    ) -> Result<Session> {
        // ---
        let activity = Arc::new(ActivityClock::new());

        let (agent, inbound) = InboundAgent::new(
            source,
            BytesMapper,
            true,
            Arc::clone(&activity),
            binding.local_stream_id,
        );
        let inbound_agent = spawn_agent(agent);
        let sequencer = WriteSequencer::new(sink);
        let heartbeat = HeartbeatSender::start(
            binding.session_id,
            Arc::clone(&control),
            options.heartbeat_interval,
        );

        let (closed_tx, _) = watch::channel(false);
        let session = Session {
            inner: Arc::new(SessionInner {
                binding,
                activity: Arc::clone(&activity),
                sequencer,
                inbound,
                control,
                state: Mutex::new(SessionState::Connecting),
                closing: AtomicBool::new(false),
                closed_tx,
                teardown: Mutex::new(Some(Teardown {
                    watchdog: Arc::clone(&watchdog),
                    heartbeat,
                    dispatcher: Arc::clone(&dispatcher),
                    inbound_agent,
                })),
            }),
        };

        // Route peer heartbeats and disconnects to this session.
        let disconnect_session = session.clone();
        dispatcher.register_session(
            binding.session_id,
            SessionHooks {
                activity: Arc::clone(&activity),
                on_disconnect: Box::new(move |reason| {
                    tracing::debug!(session_id = %disconnect_session.session_id(), ?reason, "closing on peer disconnect");
                    tokio::spawn(async move { disconnect_session.close().await });
                }),
            },
        );

        // Watchdog registration last: a breach closes the fully-wired
        // session.
        let breach_session = session.clone();
        let watchdog_clock = Arc::clone(&activity);
        if let Err(err) = watchdog.track(
            binding.session_id,
            options.heartbeat_timeout,
            move || watchdog_clock.last_activity(),
            move || {
                tokio::spawn(async move { breach_session.close_for_liveness().await });
            },
        ) {
            // The tracked record belongs to another session; teardown must
            // leave it in place.
            session.close_inner(false).await;
            return Err(err);
        }

        *session.inner.state.lock().unwrap() = SessionState::Active;
        tracing::info!(
            session_id = %binding.session_id,
            local_stream_id = binding.local_stream_id,
            peer_stream_id = binding.peer_stream_id,
            "session bound"
        );
        Ok(session)
    }

    // ---

    pub fn binding(&self) -> SessionBinding {
        self.inner.binding
    }

    pub fn session_id(&self) -> u64 {
        self.inner.binding.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    // ---

    /// Queue an outbound stream; completes when it has fully drained.
    pub fn submit(&self, source: impl BufferSource + 'static) -> StreamCompletion {
        self.inner.sequencer.submit(source)
    }

    // ---

    /// Subscribe the inbound side into a channel with unbounded demand.
    /// Fails if something already subscribed.
    pub fn messages(&self) -> Result<mpsc::UnboundedReceiver<Result<Bytes>>> {
        // ---
        let (consumer, rx) = channel_consumer();
        let sub = self.inner.inbound.subscribe(Box::new(consumer))?;
        sub.request(u64::MAX);
        Ok(rx)
    }

    // ---

    /// Raw inbound handle, for consumers managing their own demand.
    pub fn inbound(&self) -> InboundHandle<Bytes> {
        self.inner.inbound.clone()
    }

    // ---

    /// Resolves to `true` once the session is fully closed. Any number of
    /// waiters may hold one.
    pub fn on_close(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    // ---

    /// Orderly shutdown: tell the peer, then close locally. A no-op once
    /// closing has begun.
    pub async fn disconnect(&self) {
        // ---
        if self.inner.closing.load(Ordering::Acquire) {
            return;
        }
        let msg = ControlMessage::Disconnect {
            session_id: self.session_id(),
            reason: DisconnectReason::Requested,
        };
        if let Err(err) = self.inner.control.send(msg).await {
            tracing::debug!(session_id = %self.session_id(), "disconnect notify failed: {err}");
        }
        self.close().await;
    }

    // ---

    /// Liveness-breach teardown: tell the peer why, surface the breach to
    /// the inbound consumer, then close as usual.
    async fn close_for_liveness(&self) {
        // ---
        if self.inner.closing.load(Ordering::Acquire) {
            return;
        }
        let msg = ControlMessage::Disconnect {
            session_id: self.session_id(),
            reason: DisconnectReason::LivenessTimeout,
        };
        if let Err(err) = self.inner.control.send(msg).await {
            tracing::debug!(session_id = %self.session_id(), "liveness disconnect notify failed: {err}");
        }
        self.inner
            .inbound
            .dispose_with(FlowLayError::LivenessTimeout(self.session_id()));
        self.close().await;
    }

    // ---

    /// Release every session resource. Idempotent: the first caller runs
    /// the teardown, everyone else returns once it is done.
    pub async fn close(&self) {
        self.close_inner(true).await;
    }

    // ---

    /// `untrack_watchdog` is false only for a bind that failed before it
    /// owned a watchdog record, so an existing record survives.
    async fn close_inner(&self, untrack_watchdog: bool) {
        // ---
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.state.lock().unwrap() = SessionState::Closing;
        tracing::info!(session_id = %self.session_id(), "session closing");

        let teardown = self.inner.teardown.lock().unwrap().take();
        if let Some(teardown) = teardown {
            if untrack_watchdog {
                teardown.watchdog.untrack(self.session_id());
            }
            teardown.heartbeat.stop();
            teardown.dispatcher.unregister_session(self.session_id());
            self.inner.inbound.dispose();
            teardown.inbound_agent.stop().await;
            self.inner.sequencer.dispose();
        }

        *self.inner.state.lock().unwrap() = SessionState::Closed;
        let _ = self.inner.closed_tx.send(true);
    }

    // ---

    pub fn is_closed(&self) -> bool {
        *self.inner.state.lock().unwrap() == SessionState::Closed
    }

    // ---

    /// Last inbound activity, for liveness introspection.
    pub fn activity(&self) -> &ActivityClock {
        &self.inner.activity
    }
}

// ---

/// Demand-managed subscription re-export for session consumers.
pub type SessionSubscription = InboundSubscription<Bytes>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use async_trait::async_trait;

    use flowlay_domain::{
        Fragment, FlowLayError, OfferOutcome, PollControl,
    };

    use super::*;

    // ---

    struct NullSink;

    impl flowlay_domain::OutboundSink for NullSink {
        fn offer(&self, _buf: &Bytes) -> OfferOutcome {
            OfferOutcome::Accepted
        }
    }

    // ---

    struct NullSource {
        closed: bool,
    }

    impl PollSource for NullSource {
        fn poll(
            &mut self,
            _handler: &mut dyn FnMut(Fragment<'_>) -> PollControl,
            _limit: usize,
        ) -> usize {
            0
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    // ---

    struct RecordingChannel {
        sent: Mutex<Vec<ControlMessage>>,
    }

    #[async_trait]
    impl ControlChannel for RecordingChannel {
        async fn send(&self, msg: ControlMessage) -> Result<()> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    // ---

    async fn bound_session(channel: Arc<RecordingChannel>) -> Session {
        // ---
        let options = EngineOptions::default();
        let dispatcher = ControlDispatcher::new();
        let watchdog = HeartbeatWatchdog::start(options.watchdog_tick);

        Session::bind(
            SessionBinding {
                session_id: 7,
                local_stream_id: 42,
                peer_stream_id: 99,
            },
            Box::new(NullSink),
            Box::new(NullSource { closed: false }),
            channel,
            dispatcher,
            watchdog,
            &options,
        )
        .await
        .unwrap()
    }

    // ---

    /// Close is idempotent and the close signal resolves exactly once,
    /// observable by several waiters.
    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        // ---
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let session = bound_session(channel).await;
        assert_eq!(session.state(), SessionState::Active);

        let mut waiter_a = session.on_close();
        let mut waiter_b = session.on_close();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_closed());

        waiter_a.wait_for(|closed| *closed).await.unwrap();
        waiter_b.wait_for(|closed| *closed).await.unwrap();
    }

    // ---

    /// After close, outbound submissions fail with a disposed error and
    /// the inbound side is terminated.
    #[tokio::test]
    async fn close_disposes_both_directions() {
        // ---
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let session = bound_session(channel).await;

        session.close().await;

        let completion = session.submit(crate::sequencer::StaticBuffers::new([
            Bytes::from_static(b"late"),
        ]));
        assert_eq!(completion.wait().await.unwrap_err(), FlowLayError::Disposed);

        // The inbound slot is terminated, so a subscribe attempt fails.
        let err = session.messages().unwrap_err();
        assert_eq!(err, FlowLayError::DuplicateSubscription);
    }

    // ---

    /// Disconnect notifies the peer exactly once and then closes; a
    /// repeat is a no-op.
    #[tokio::test]
    async fn disconnect_notifies_peer_then_closes() {
        // ---
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let session = bound_session(Arc::clone(&channel)).await;

        session.disconnect().await;
        session.disconnect().await;

        let disconnects: Vec<ControlMessage> = channel
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, ControlMessage::Disconnect { .. }))
            .cloned()
            .collect();
        assert_eq!(
            disconnects,
            vec![ControlMessage::Disconnect {
                session_id: 7,
                reason: DisconnectReason::Requested,
            }]
        );
        assert!(session.is_closed());
    }

    // ---

    /// A second bind reusing a live session id is rejected: the duplicate
    /// closes itself and the original keeps its watchdog record.
    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        // ---
        let options = EngineOptions::default();
        let watchdog = HeartbeatWatchdog::start(options.watchdog_tick);
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let binding = SessionBinding {
            session_id: 7,
            local_stream_id: 42,
            peer_stream_id: 99,
        };

        let first = Session::bind(
            binding,
            Box::new(NullSink),
            Box::new(NullSource { closed: false }),
            channel.clone(),
            ControlDispatcher::new(),
            Arc::clone(&watchdog),
            &options,
        )
        .await
        .unwrap();
        assert_eq!(first.state(), SessionState::Active);

        let err = Session::bind(
            binding,
            Box::new(NullSink),
            Box::new(NullSource { closed: false }),
            channel.clone(),
            ControlDispatcher::new(),
            Arc::clone(&watchdog),
            &options,
        )
        .await
        .err()
        .expect("second bind with a live session id must fail");
        assert_eq!(err, FlowLayError::AlreadyTracked(7));

        assert!(watchdog.is_tracked(7), "original lost its watchdog record");
        assert_eq!(first.state(), SessionState::Active);

        first.close().await;
        assert!(!watchdog.is_tracked(7));
    }

    // ---

    /// A stalled activity clock gets the session closed by the watchdog,
    /// and the inbound consumer learns it was a liveness breach.
    #[tokio::test]
    async fn watchdog_breach_closes_session() {
        // ---
        let options = EngineOptions::default()
            .with_heartbeat_timeout(Duration::from_millis(40))
            .with_watchdog_tick(Duration::from_millis(10));
        let dispatcher = ControlDispatcher::new();
        let watchdog = HeartbeatWatchdog::start(options.watchdog_tick);

        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let session = Session::bind(
            SessionBinding {
                session_id: 1,
                local_stream_id: 1,
                peer_stream_id: 2,
            },
            Box::new(NullSink),
            Box::new(NullSource { closed: false }),
            channel,
            dispatcher,
            Arc::clone(&watchdog),
            &options,
        )
        .await
        .unwrap();
        let mut inbox = session.messages().unwrap();

        let mut closed = session.on_close();
        tokio::time::timeout(Duration::from_millis(500), closed.wait_for(|c| *c))
            .await
            .expect("watchdog never closed the session")
            .unwrap();
        assert!(!watchdog.is_tracked(1));
        assert_eq!(
            inbox.recv().await.unwrap().unwrap_err(),
            FlowLayError::LivenessTimeout(1)
        );
    }
}
