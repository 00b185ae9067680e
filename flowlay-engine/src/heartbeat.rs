//! Session liveness: activity clock, watchdog, heartbeat sender.
//!
//! # Design
//!
//! Each session owns an [`ActivityClock`] touched by every inbound signal
//! (data fragments and heartbeat control messages). The
//! [`HeartbeatWatchdog`] runs one independent periodic task scanning all
//! tracked sessions; a session whose clock has been silent longer than its
//! timeout is untracked and torn down exactly once. The record map is the
//! only structure mutated by two actors (the scan task, and application
//! threads calling `untrack` during dispose); removal under the mutex is
//! what guarantees single-fire.
//!
//! The [`HeartbeatSender`] is the outbound counterpart: a per-session timer
//! task publishing `Heartbeat` control messages until stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ---

use tokio::sync::Notify;

// ---

use flowlay_domain::{ControlChannel, ControlMessage, FlowLayError, Result};

// ---------------------------------------------------------------------------
// ActivityClock
// ---------------------------------------------------------------------------

/// Atomic last-activity timestamp.
///
/// `Instant` cannot live in an atomic, so the clock stores nanoseconds
/// elapsed since its own creation. Creation counts as activity.
#[derive(Debug)]
pub struct ActivityClock {
    // ---
    base: Instant,
    elapsed_nanos: AtomicU64,
}

// ---

impl ActivityClock {
    // ---
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
        }
    }

    // ---

    /// Record activity now.
    pub fn touch(&self) {
        let nanos = self.base.elapsed().as_nanos() as u64;
        self.elapsed_nanos.store(nanos, Ordering::Release);
    }

    // ---

    /// Instant of the most recent activity.
    pub fn last_activity(&self) -> Instant {
        let nanos = self.elapsed_nanos.load(Ordering::Acquire);
        self.base + Duration::from_nanos(nanos)
    }

    // ---

    /// Silence duration since the last activity.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }
}

// ---

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HeartbeatWatchdog
// ---------------------------------------------------------------------------

struct HeartbeatRecord {
    // ---
    timeout: Duration,
    /// Live accessor into the session's clock, not a copied timestamp.
    last_activity: Box<dyn Fn() -> Instant + Send>,
    /// Taken exactly once, on breach.
    teardown: Box<dyn FnOnce() + Send>,
}

// ---

/// Declares sessions dead after a timeout of silence.
///
/// One watchdog serves all sessions of an endpoint. Teardown for a given
/// session fires at most once even if the scan task and a concurrent
/// `untrack` race: whichever removes the record wins.
pub struct HeartbeatWatchdog {
    // ---
    records: Arc<Mutex<HashMap<u64, HeartbeatRecord>>>,
    shutdown: Arc<Notify>,
}

// ---

impl HeartbeatWatchdog {
    // ---
    /// Spawn the scan task with the given tick period.
    pub fn start(tick_period: Duration) -> Arc<Self> {
        // ---
        let records: Arc<Mutex<HashMap<u64, HeartbeatRecord>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let scan_records = Arc::clone(&records);
        let scan_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scan_shutdown.notified() => break,
                    _ = ticker.tick() => scan(&scan_records),
                }
            }
            tracing::debug!("heartbeat watchdog stopped");
        });

        Arc::new(Self { records, shutdown })
    }

    // ---

    /// Register a session for liveness monitoring.
    ///
    /// Tracking an id that is already tracked is a contract violation and
    /// returns [`FlowLayError::AlreadyTracked`] without replacing the
    /// existing record.
    pub fn track(
        &self,
        session_id: u64,
        timeout: Duration,
        last_activity: impl Fn() -> Instant + Send + 'static,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        // ---
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&session_id) {
            return Err(FlowLayError::AlreadyTracked(session_id));
        }
        records.insert(
            session_id,
            HeartbeatRecord {
                timeout,
                last_activity: Box::new(last_activity),
                teardown: Box::new(teardown),
            },
        );
        Ok(())
    }

    // ---

    /// Stop monitoring a session. Unknown ids are a no-op: a session
    /// already torn down by the scan task untracks itself.
    pub fn untrack(&self, session_id: u64) {
        // ---
        self.records.lock().unwrap().remove(&session_id);
    }

    // ---

    pub fn is_tracked(&self, session_id: u64) -> bool {
        self.records.lock().unwrap().contains_key(&session_id)
    }

    // ---

    /// Stop the scan task. Tracked records are dropped without teardown.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

// ---

/// One watchdog pass: remove breached records under the lock, run their
/// teardowns after releasing it.
fn scan(records: &Mutex<HashMap<u64, HeartbeatRecord>>) {
    // ---
    let now = Instant::now();
    let mut breached: Vec<(u64, Box<dyn FnOnce() + Send>)> = Vec::new();

    {
        let mut records = records.lock().unwrap();
        let dead: Vec<u64> = records
            .iter()
            .filter(|(_, record)| {
                now.saturating_duration_since((record.last_activity)()) > record.timeout
            })
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            if let Some(record) = records.remove(&id) {
                breached.push((id, record.teardown));
            }
        }
    }

    for (session_id, teardown) in breached {
        tracing::warn!(%session_id, "session liveness timeout, tearing down");
        teardown();
    }
}

// ---------------------------------------------------------------------------
// HeartbeatSender
// ---------------------------------------------------------------------------

/// Per-session timer task publishing `Heartbeat` control messages.
pub struct HeartbeatSender {
    // ---
    stop: Arc<Notify>,
}

// ---

impl HeartbeatSender {
    // ---
    /// Spawn the sender task. It runs until [`HeartbeatSender::stop`] or
    /// until the control channel fails.
    pub fn start(
        session_id: u64,
        channel: Arc<dyn ControlChannel>,
        interval: Duration,
    ) -> Self {
        // ---
        let stop = Arc::new(Notify::new());
        let task_stop = Arc::clone(&stop);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so the
            // first heartbeat goes out one interval after bind.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_stop.notified() => break,
                    _ = ticker.tick() => {
                        let timestamp_ms = unix_millis();
                        let msg = ControlMessage::Heartbeat { session_id, timestamp_ms };
                        if let Err(e) = channel.send(msg).await {
                            tracing::warn!(%session_id, "heartbeat send failed: {e}; sender exiting");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(%session_id, "heartbeat sender stopped");
        });

        Self { stop }
    }

    // ---

    /// Stop the sender task. Idempotent.
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

// ---

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
