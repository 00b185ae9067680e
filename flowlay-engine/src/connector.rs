//! Connect handshake and control-plane routing.
//!
//! # Design
//!
//! Each endpoint runs one [`ControlDispatcher`]: a task draining the
//! inbound control receiver and routing each message to the party that
//! cares. Connect acks resolve pending connect attempts in FIFO order,
//! heartbeats refresh session activity clocks, disconnects drive session
//! close, and connect requests flow to the [`ServerAcceptor`].
//!
//! The [`ClientConnector`] walks the handshake state machine: allocate a
//! stream id, send `ConnectRequest`, await the matching `ConnectAck` under
//! the connect timeout, then bind the session. A failed attempt (timeout
//! or channel loss) is local to that attempt; the connector stays usable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ---

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// ---

use flowlay_domain::{
    //
    ControlChannel,
    ControlMessage,
    ControlReceiver,
    DisconnectReason,
    FlowLayError,
    Result,
    TransportResources,
};

// ---

use super::heartbeat::{ActivityClock, HeartbeatWatchdog};
use super::options::EngineOptions;
use super::session::{Session, SessionBinding};

// ---------------------------------------------------------------------------
// ControlDispatcher
// ---------------------------------------------------------------------------

/// Per-session routing hooks registered while a session is live.
pub struct SessionHooks {
    // ---
    /// Touched on every `Heartbeat` carrying the session's id.
    pub activity: Arc<ActivityClock>,

    /// Invoked once when a `Disconnect` for the session arrives. The
    /// hooks are removed before the call, so a racing unregister wins or
    /// loses atomically.
    pub on_disconnect: Box<dyn FnOnce(DisconnectReason) + Send>,
}

// ---

struct AckWaiter {
    // ---
    token: u64,
    tx: oneshot::Sender<(u64, i32)>,
}

// ---

/// Routes inbound control messages. One per endpoint.
pub struct ControlDispatcher {
    // ---
    acks: Mutex<VecDeque<AckWaiter>>,
    tokens: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionHooks>>,
    acceptor: Mutex<Option<mpsc::UnboundedSender<i32>>>,
}

// ---

impl ControlDispatcher {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acks: Mutex::new(VecDeque::new()),
            tokens: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            acceptor: Mutex::new(None),
        })
    }

    // ---

    /// Spawn the routing task over the inbound control receiver. The task
    /// ends when the receiver closes.
    pub fn start(self: &Arc<Self>, mut rx: ControlReceiver) -> JoinHandle<()> {
        // ---
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                dispatcher.dispatch(msg);
            }
            tracing::debug!("control dispatcher stopped, receiver closed");
        })
    }

    // ---

    fn dispatch(&self, msg: ControlMessage) {
        // ---
        match msg {
            ControlMessage::ConnectAck {
                session_id,
                peer_stream_id,
            } => {
                let waiter = self.acks.lock().unwrap().pop_front();
                match waiter {
                    Some(waiter) => {
                        if waiter.tx.send((session_id, peer_stream_id)).is_err() {
                            tracing::warn!(%session_id, "connect attempt gone before its ack");
                        }
                    }
                    None => {
                        tracing::warn!(%session_id, "unsolicited connect ack dropped");
                    }
                }
            }
            ControlMessage::Heartbeat { session_id, .. } => {
                let sessions = self.sessions.lock().unwrap();
                match sessions.get(&session_id) {
                    Some(hooks) => hooks.activity.touch(),
                    None => tracing::trace!(%session_id, "heartbeat for unknown session"),
                }
            }
            ControlMessage::Disconnect { session_id, reason } => {
                let hooks = self.sessions.lock().unwrap().remove(&session_id);
                match hooks {
                    Some(hooks) => {
                        tracing::debug!(%session_id, ?reason, "peer disconnect");
                        (hooks.on_disconnect)(reason);
                    }
                    None => tracing::debug!(%session_id, "disconnect for unknown session"),
                }
            }
            ControlMessage::ConnectRequest {
                requester_stream_id,
            } => {
                let acceptor = self.acceptor.lock().unwrap();
                match &*acceptor {
                    Some(tx) => {
                        if tx.send(requester_stream_id).is_err() {
                            tracing::warn!(requester_stream_id, "acceptor gone, connect request dropped");
                        }
                    }
                    None => {
                        tracing::warn!(requester_stream_id, "connect request but no acceptor");
                    }
                }
            }
        }
    }

    // ---

    /// Register a connect attempt. Acks resolve waiters in enlist order.
    fn enlist_connect(&self) -> (u64, oneshot::Receiver<(u64, i32)>) {
        // ---
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().push_back(AckWaiter { token, tx });
        (token, rx)
    }

    // ---

    /// Withdraw a timed-out attempt so a late ack cannot resolve it and
    /// steal a slot from the next attempt.
    fn abandon_connect(&self, token: u64) {
        self.acks.lock().unwrap().retain(|w| w.token != token);
    }

    // ---

    pub(crate) fn register_session(&self, session_id: u64, hooks: SessionHooks) {
        // ---
        if self
            .sessions
            .lock()
            .unwrap()
            .insert(session_id, hooks)
            .is_some()
        {
            tracing::warn!(%session_id, "session hooks replaced, duplicate registration");
        }
    }

    // ---

    pub(crate) fn unregister_session(&self, session_id: u64) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    // ---

    fn set_acceptor(&self, tx: mpsc::UnboundedSender<i32>) {
        *self.acceptor.lock().unwrap() = Some(tx);
    }
}

// ---------------------------------------------------------------------------
// ClientConnector
// ---------------------------------------------------------------------------

/// Initiates sessions: Idle → AwaitingAck → Bound | Failed, per attempt.
pub struct ClientConnector {
    // ---
    resources: Arc<dyn TransportResources>,
    control: Arc<dyn ControlChannel>,
    dispatcher: Arc<ControlDispatcher>,
    watchdog: Arc<HeartbeatWatchdog>,
    options: EngineOptions,
    stream_ids: AtomicI32,
    /// Serializes enlist-then-send, so request wire order always equals
    /// ack waiter order.
    connect_gate: tokio::sync::Mutex<()>,
    dispatch_task: JoinHandle<()>,
}

// ---

impl ClientConnector {
    // ---
    /// Wire the connector to a transport. Starts the control dispatcher
    /// over `control_rx` and the shared heartbeat watchdog.
    pub fn new(
        resources: Arc<dyn TransportResources>,
        control: Arc<dyn ControlChannel>,
        control_rx: ControlReceiver,
        options: EngineOptions,
    ) -> Self {
        // ---
        let dispatcher = ControlDispatcher::new();
        let dispatch_task = dispatcher.start(control_rx);
        let watchdog = HeartbeatWatchdog::start(options.watchdog_tick);

        Self {
            resources,
            control,
            dispatcher,
            watchdog,
            options,
            stream_ids: AtomicI32::new(1),
            connect_gate: tokio::sync::Mutex::new(()),
            dispatch_task,
        }
    }

    // ---

    /// Fix the first allocated inbound stream id. Deterministic ids make
    /// transport wiring reproducible.
    pub fn with_initial_stream_id(self, first: i32) -> Self {
        self.stream_ids.store(first, Ordering::Relaxed);
        self
    }

    // ---

    /// Run one connect handshake and bind the resulting session.
    ///
    /// Allocates a fresh inbound stream id, sends `ConnectRequest`, and
    /// waits for the matching `ConnectAck` under the connect timeout. A
    /// timeout or channel failure fails this attempt only.
    pub async fn connect(&self) -> Result<Session> {
        // ---
        let stream_id = self.stream_ids.fetch_add(1, Ordering::Relaxed);

        // Acks resolve waiters FIFO, so a request must not reach the wire
        // ahead of a waiter enlisted before it. The gate holds concurrent
        // attempts in enlist order through their send.
        let (token, ack_rx) = {
            let _gate = self.connect_gate.lock().await;
            let (token, ack_rx) = self.dispatcher.enlist_connect();

            tracing::debug!(stream_id, "connect: sending request");
            let request = ControlMessage::ConnectRequest {
                requester_stream_id: stream_id,
            };
            if let Err(err) = self.control.send(request).await {
                self.dispatcher.abandon_connect(token);
                return Err(err);
            }
            (token, ack_rx)
        };

        let (session_id, peer_stream_id) =
            match tokio::time::timeout(self.options.connect_timeout, ack_rx).await {
                Ok(Ok(ack)) => ack,
                Ok(Err(_)) => {
                    return Err(FlowLayError::HandshakeRejected(
                        "control dispatcher stopped".into(),
                    ));
                }
                Err(_) => {
                    self.dispatcher.abandon_connect(token);
                    tracing::warn!(stream_id, "connect: no ack within timeout");
                    return Err(FlowLayError::HandshakeTimeout(self.options.connect_timeout));
                }
            };

        tracing::debug!(stream_id, %session_id, peer_stream_id, "connect: acknowledged");

        let sink = self.resources.open_sink(peer_stream_id).await?;
        let source = self.resources.open_source(stream_id).await?;
        let binding = SessionBinding {
            session_id,
            local_stream_id: stream_id,
            peer_stream_id,
        };

        Session::bind(
            binding,
            sink,
            source,
            Arc::clone(&self.control),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.watchdog),
            &self.options,
        )
        .await
    }

    // ---

    /// Stop the dispatcher task and the watchdog. Live sessions are left
    /// to their own `close`.
    pub fn shutdown(&self) {
        // ---
        self.dispatch_task.abort();
        self.watchdog.shutdown();
    }
}

// ---

impl Drop for ClientConnector {
    // ---
    // A connector dropped without `shutdown` must not leave its tasks
    // running.
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// ServerAcceptor
// ---------------------------------------------------------------------------

/// Accepts sessions: on each `ConnectRequest`, allocates a session id and
/// a local data stream, binds the session, then acks the requester.
pub struct ServerAcceptor {
    // ---
    resources: Arc<dyn TransportResources>,
    control: Arc<dyn ControlChannel>,
    dispatcher: Arc<ControlDispatcher>,
    watchdog: Arc<HeartbeatWatchdog>,
    options: EngineOptions,
    session_ids: AtomicU64,
    stream_ids: AtomicI32,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<i32>>,
    dispatch_task: JoinHandle<()>,
}

// ---

impl ServerAcceptor {
    // ---
    pub fn new(
        resources: Arc<dyn TransportResources>,
        control: Arc<dyn ControlChannel>,
        control_rx: ControlReceiver,
        options: EngineOptions,
    ) -> Self {
        // ---
        let dispatcher = ControlDispatcher::new();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        dispatcher.set_acceptor(request_tx);
        let dispatch_task = dispatcher.start(control_rx);
        let watchdog = HeartbeatWatchdog::start(options.watchdog_tick);

        Self {
            resources,
            control,
            dispatcher,
            watchdog,
            options,
            session_ids: AtomicU64::new(1),
            stream_ids: AtomicI32::new(1000),
            dispatch_task,
            requests: tokio::sync::Mutex::new(request_rx),
        }
    }

    // ---

    /// Fix the first allocated session id.
    pub fn with_initial_session_id(self, first: u64) -> Self {
        self.session_ids.store(first, Ordering::Relaxed);
        self
    }

    // ---

    /// Fix the first allocated server-side data stream id.
    pub fn with_initial_stream_id(self, first: i32) -> Self {
        self.stream_ids.store(first, Ordering::Relaxed);
        self
    }

    // ---

    /// Wait for the next `ConnectRequest`, bind a session for it, and ack
    /// the requester. The session is live before the ack leaves, so data
    /// sent immediately after the ack is never missed.
    pub async fn accept(&self) -> Result<Session> {
        // ---
        let requester_stream_id = self
            .requests
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| FlowLayError::TransportClosed("control channel closed".into()))?;

        let session_id = self.session_ids.fetch_add(1, Ordering::Relaxed);
        let local_stream_id = self.stream_ids.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            %session_id,
            requester_stream_id,
            local_stream_id,
            "accept: binding session"
        );

        let sink = self.resources.open_sink(requester_stream_id).await?;
        let source = self.resources.open_source(local_stream_id).await?;
        let binding = SessionBinding {
            session_id,
            local_stream_id,
            peer_stream_id: requester_stream_id,
        };

        let session = Session::bind(
            binding,
            sink,
            source,
            Arc::clone(&self.control),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.watchdog),
            &self.options,
        )
        .await?;

        self.control
            .send(ControlMessage::ConnectAck {
                session_id,
                peer_stream_id: local_stream_id,
            })
            .await?;

        Ok(session)
    }

    // ---

    /// Stop the dispatcher task and the watchdog.
    pub fn shutdown(&self) {
        // ---
        self.dispatch_task.abort();
        self.watchdog.shutdown();
    }
}

// ---

impl Drop for ServerAcceptor {
    // ---
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use flowlay_domain::{Fragment, OfferOutcome, PollControl};

    use super::*;

    // ---

    /// Control channel that records everything and never replies.
    struct SilentChannel {
        // ---
        sent: Mutex<Vec<ControlMessage>>,
    }

    // ---

    impl SilentChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    // ---

    #[async_trait]
    impl ControlChannel for SilentChannel {
        async fn send(&self, msg: ControlMessage) -> Result<()> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    // ---

    struct NoResources;

    #[async_trait]
    impl TransportResources for NoResources {
        async fn open_sink(
            &self,
            _stream_id: i32,
        ) -> Result<Box<dyn flowlay_domain::OutboundSink>> {
            Err(FlowLayError::TransportClosed("no media".into()))
        }

        async fn open_source(
            &self,
            _stream_id: i32,
        ) -> Result<Box<dyn flowlay_domain::PollSource>> {
            Err(FlowLayError::TransportClosed("no media".into()))
        }
    }

    // ---

    struct AcceptingSink;

    impl flowlay_domain::OutboundSink for AcceptingSink {
        fn offer(&self, _buf: &Bytes) -> OfferOutcome {
            OfferOutcome::Accepted
        }
    }

    // ---

    struct IdleSource;

    impl flowlay_domain::PollSource for IdleSource {
        fn poll(
            &mut self,
            _handler: &mut dyn FnMut(Fragment<'_>) -> PollControl,
            _limit: usize,
        ) -> usize {
            0
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn close(&mut self) {}
    }

    // ---

    struct StubResources;

    #[async_trait]
    impl TransportResources for StubResources {
        async fn open_sink(
            &self,
            _stream_id: i32,
        ) -> Result<Box<dyn flowlay_domain::OutboundSink>> {
            Ok(Box::new(AcceptingSink))
        }

        async fn open_source(
            &self,
            _stream_id: i32,
        ) -> Result<Box<dyn flowlay_domain::PollSource>> {
            Ok(Box::new(IdleSource))
        }
    }

    // ---

    /// Acks resolve enlisted connect attempts strictly in FIFO order.
    #[tokio::test]
    async fn acks_resolve_waiters_in_fifo_order() {
        // ---
        let dispatcher = ControlDispatcher::new();
        let (_t1, rx1) = dispatcher.enlist_connect();
        let (_t2, rx2) = dispatcher.enlist_connect();

        dispatcher.dispatch(ControlMessage::ConnectAck {
            session_id: 7,
            peer_stream_id: 99,
        });
        dispatcher.dispatch(ControlMessage::ConnectAck {
            session_id: 8,
            peer_stream_id: 100,
        });

        assert_eq!(rx1.await.unwrap(), (7, 99));
        assert_eq!(rx2.await.unwrap(), (8, 100));
    }

    // ---

    /// An abandoned attempt never consumes an ack meant for a later one.
    #[tokio::test]
    async fn abandoned_waiter_does_not_steal_acks() {
        // ---
        let dispatcher = ControlDispatcher::new();
        let (t1, rx1) = dispatcher.enlist_connect();
        dispatcher.abandon_connect(t1);
        drop(rx1);

        let (_t2, rx2) = dispatcher.enlist_connect();
        dispatcher.dispatch(ControlMessage::ConnectAck {
            session_id: 5,
            peer_stream_id: 50,
        });

        assert_eq!(rx2.await.unwrap(), (5, 50));
    }

    // ---

    /// An ack with no waiter at all is dropped without effect.
    #[tokio::test]
    async fn unsolicited_ack_is_dropped() {
        // ---
        let dispatcher = ControlDispatcher::new();
        dispatcher.dispatch(ControlMessage::ConnectAck {
            session_id: 1,
            peer_stream_id: 2,
        });

        let (_t, rx) = dispatcher.enlist_connect();
        dispatcher.dispatch(ControlMessage::ConnectAck {
            session_id: 3,
            peer_stream_id: 4,
        });
        assert_eq!(rx.await.unwrap(), (3, 4));
    }

    // ---

    /// Heartbeats touch the registered session's clock; unknown ids are
    /// ignored.
    #[tokio::test]
    async fn heartbeat_touches_registered_session() {
        // ---
        let dispatcher = ControlDispatcher::new();
        let activity = Arc::new(ActivityClock::new());
        dispatcher.register_session(
            9,
            SessionHooks {
                activity: Arc::clone(&activity),
                on_disconnect: Box::new(|_| {}),
            },
        );

        let before = activity.last_activity();
        std::thread::sleep(Duration::from_millis(5));

        dispatcher.dispatch(ControlMessage::Heartbeat {
            session_id: 9,
            timestamp_ms: 0,
        });
        assert!(activity.last_activity() > before);

        dispatcher.dispatch(ControlMessage::Heartbeat {
            session_id: 12345,
            timestamp_ms: 0,
        });
    }

    // ---

    /// A disconnect fires the hook exactly once even if repeated.
    #[tokio::test]
    async fn disconnect_fires_hook_once() {
        // ---
        let dispatcher = ControlDispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        dispatcher.register_session(
            3,
            SessionHooks {
                activity: Arc::new(ActivityClock::new()),
                on_disconnect: Box::new(move |reason| {
                    assert_eq!(reason, DisconnectReason::Requested);
                    hook_fired.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        let disconnect = ControlMessage::Disconnect {
            session_id: 3,
            reason: DisconnectReason::Requested,
        };
        dispatcher.dispatch(disconnect.clone());
        dispatcher.dispatch(disconnect);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // ---

    /// A connect attempt with no answering peer fails with a handshake
    /// timeout and leaves the connector usable.
    #[tokio::test]
    async fn connect_times_out_without_ack() {
        // ---
        let channel = SilentChannel::new();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let options = EngineOptions::default()
            .with_connect_timeout(Duration::from_millis(20));

        let control: Arc<dyn ControlChannel> = channel.clone();
        let connector = ClientConnector::new(
            Arc::new(NoResources),
            control,
            control_rx,
            options,
        )
        .with_initial_stream_id(42);

        let err = connector
            .connect()
            .await
            .err()
            .expect("connect must time out");
        assert!(matches!(err, FlowLayError::HandshakeTimeout(_)));

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![ControlMessage::ConnectRequest {
                requester_stream_id: 42
            }]
        );
        assert!(connector.dispatcher.acks.lock().unwrap().is_empty());

        connector.shutdown();
    }

    // ---

    /// Control channel that answers every connect request with an ack
    /// derived from the requester's stream id, stalling the first
    /// request until released.
    struct StallFirstChannel {
        // ---
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        release: tokio::sync::Notify,
        stalled_once: AtomicBool,
    }

    #[async_trait]
    impl ControlChannel for StallFirstChannel {
        async fn send(&self, msg: ControlMessage) -> Result<()> {
            // ---
            if let ControlMessage::ConnectRequest {
                requester_stream_id,
            } = msg
            {
                if !self.stalled_once.swap(true, Ordering::SeqCst) {
                    self.release.notified().await;
                }
                let _ = self.control_tx.send(ControlMessage::ConnectAck {
                    session_id: requester_stream_id as u64 * 10,
                    peer_stream_id: requester_stream_id + 100,
                });
            }
            Ok(())
        }
    }

    // ---

    /// Overlapping connect calls each bind the session acked for their
    /// own request: a stalled first request must not let the second
    /// request's ack resolve the first attempt.
    #[tokio::test]
    async fn concurrent_connects_bind_their_own_sessions() {
        // ---
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(StallFirstChannel {
            control_tx,
            release: tokio::sync::Notify::new(),
            stalled_once: AtomicBool::new(false),
        });

        let control: Arc<dyn ControlChannel> = channel.clone();
        let connector = Arc::new(ClientConnector::new(
            Arc::new(StubResources),
            control,
            control_rx,
            EngineOptions::default(),
        ));

        let first = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.release.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        for session in [&first, &second] {
            let binding = session.binding();
            assert_eq!(
                binding.session_id,
                binding.local_stream_id as u64 * 10,
                "attempt bound a session acked for another request"
            );
            assert_eq!(binding.peer_stream_id, binding.local_stream_id + 100);
        }

        first.close().await;
        second.close().await;
        connector.shutdown();
    }

    // ---

    /// Dropping a connector without `shutdown` still stops its dispatch
    /// task, observable as the control receiver going away.
    #[tokio::test]
    async fn dropped_connector_stops_its_dispatcher() {
        // ---
        let channel = SilentChannel::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let connector = ClientConnector::new(
            Arc::new(NoResources),
            channel,
            control_rx,
            EngineOptions::default(),
        );
        drop(connector);

        tokio::time::timeout(Duration::from_millis(500), control_tx.closed())
            .await
            .expect("dispatch task kept running after drop");
    }

    // ---

    /// Same for an acceptor.
    #[tokio::test]
    async fn dropped_acceptor_stops_its_dispatcher() {
        // ---
        let channel = SilentChannel::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let acceptor = ServerAcceptor::new(
            Arc::new(NoResources),
            channel,
            control_rx,
            EngineOptions::default(),
        );
        drop(acceptor);

        tokio::time::timeout(Duration::from_millis(500), control_tx.closed())
            .await
            .expect("dispatch task kept running after drop");
    }
}
