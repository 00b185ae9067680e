//! Tick-loop driver for [`TickAgent`]s.
//!
//! An agent is a non-blocking unit of work; the driver owns the loop that
//! calls `tick` until the agent terminates or the handle stops it, backing
//! off through an [`IdleStrategy`] whenever a tick does nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---

use tokio::task::JoinHandle;

// ---

use flowlay_domain::{FlowLayError, TickAgent};

// ---

use super::idle::IdleStrategy;

// ---------------------------------------------------------------------------
// AgentHandle
// ---------------------------------------------------------------------------

/// Controls a running agent loop.
pub struct AgentHandle {
    // ---
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

// ---

impl AgentHandle {
    // ---
    /// Request the loop to exit after the in-flight tick and wait for it.
    pub async fn stop(self) {
        // ---
        self.stop.store(true, Ordering::Release);
        if self.task.await.is_err() {
            tracing::error!("agent task panicked");
        }
    }

    // ---

    /// True once the loop has exited, whether stopped or self-terminated.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ---------------------------------------------------------------------------
// spawn_agent
// ---------------------------------------------------------------------------

/// Drive `agent` on a dedicated task until it terminates or is stopped.
pub fn spawn_agent<A>(mut agent: A) -> AgentHandle
where
    A: TickAgent + 'static,
{
    // ---
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let task = tokio::spawn(async move {
        // ---
        let role = agent.role_name().to_owned();
        tracing::debug!(%role, "agent loop started");

        let mut idle = IdleStrategy::new();
        loop {
            if stop_flag.load(Ordering::Acquire) {
                tracing::debug!(%role, "agent loop stopped");
                break;
            }
            match agent.tick() {
                Ok(0) => idle.idle().await,
                Ok(_) => {
                    idle.reset();
                    // Stay cooperative on a busy stream.
                    tokio::task::yield_now().await;
                }
                Err(FlowLayError::AgentTerminated(reason)) => {
                    tracing::debug!(%role, %reason, "agent terminated");
                    break;
                }
                Err(err) => {
                    tracing::error!(%role, %err, "agent tick failed");
                    break;
                }
            }
        }
    });

    AgentHandle { stop, task }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use flowlay_domain::Result;

    use super::*;

    // ---

    struct CountingAgent {
        // ---
        ticks: Arc<AtomicUsize>,
        terminate_after: Option<usize>,
    }

    // ---

    impl TickAgent for CountingAgent {
        // ---
        fn tick(&mut self) -> Result<usize> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if self.terminate_after.is_some_and(|limit| n >= limit) {
                return Err(FlowLayError::AgentTerminated("done".into()));
            }
            Ok(1)
        }

        fn role_name(&self) -> &str {
            "counting"
        }
    }

    // ---

    /// `stop` halts the loop and awaits its exit.
    #[tokio::test]
    async fn stop_halts_the_loop() {
        // ---
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn_agent(CountingAgent {
            ticks: Arc::clone(&ticks),
            terminate_after: None,
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ticks.load(Ordering::SeqCst) > 0);

        handle.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    // ---

    /// A self-terminating agent ends its own loop.
    #[tokio::test]
    async fn terminated_agent_ends_loop() {
        // ---
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn_agent(CountingAgent {
            ticks: Arc::clone(&ticks),
            terminate_after: Some(3),
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
