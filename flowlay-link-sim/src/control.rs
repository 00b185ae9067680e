//! Crossed in-process control channel.
//!
//! Control messages travel as JSON payloads so the serde representation is
//! exercised the same way a real transport would frame it. Each direction
//! is an unbounded channel of encoded buffers plus a decoder task feeding
//! the receiving endpoint's dispatcher.

use bytes::Bytes;

// ---

use tokio::sync::mpsc;

// ---

use flowlay_domain::{ControlChannel, ControlMessage, ControlReceiver, FlowLayError, Result};

// ---------------------------------------------------------------------------
// SimControlChannel
// ---------------------------------------------------------------------------

/// Sender half of one control direction.
pub struct SimControlChannel {
    // ---
    tx: mpsc::UnboundedSender<Bytes>,
}

// ---

#[async_trait::async_trait]
impl ControlChannel for SimControlChannel {
    // ---
    async fn send(&self, msg: ControlMessage) -> Result<()> {
        // ---
        let encoded = serde_json::to_vec(&msg)
            .map_err(|e| FlowLayError::Decode(format!("control encode: {e}")))?;
        self.tx
            .send(Bytes::from(encoded))
            .map_err(|_| FlowLayError::TransportClosed("control peer gone".into()))
    }
}

// ---

/// Spawn the decoder for one direction: encoded buffers in, decoded
/// messages out. Undecodable payloads are logged and dropped.
fn decoded(mut rx: mpsc::UnboundedReceiver<Bytes>) -> ControlReceiver {
    // ---
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            match serde_json::from_slice::<ControlMessage>(&buf) {
                Ok(msg) => {
                    if out_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("sim: dropping undecodable control payload: {e}"),
            }
        }
    });
    out_rx
}

// ---

/// Build a crossed pair: what one side sends, the other receives.
pub fn control_pair() -> (
    (SimControlChannel, ControlReceiver),
    (SimControlChannel, ControlReceiver),
) {
    // ---
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

    let a = (SimControlChannel { tx: a_to_b_tx }, decoded(b_to_a_rx));
    let b = (SimControlChannel { tx: b_to_a_tx }, decoded(a_to_b_rx));
    (a, b)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // ---

    /// Messages cross the pair intact and in order.
    #[tokio::test]
    async fn crossed_pair_delivers_in_order() {
        // ---
        let ((a_tx, _a_rx), (_b_tx, mut b_rx)) = control_pair();

        a_tx.send(ControlMessage::ConnectRequest {
            requester_stream_id: 42,
        })
        .await
        .unwrap();
        a_tx.send(ControlMessage::Heartbeat {
            session_id: 7,
            timestamp_ms: 1,
        })
        .await
        .unwrap();

        assert_eq!(
            b_rx.recv().await.unwrap(),
            ControlMessage::ConnectRequest {
                requester_stream_id: 42
            }
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            ControlMessage::Heartbeat {
                session_id: 7,
                timestamp_ms: 1
            }
        );
    }

    // ---

    /// A send after the peer dropped its receiver fails with a transport
    /// closure.
    #[tokio::test]
    async fn send_to_gone_peer_fails() {
        // ---
        let ((a_tx, _a_rx), (b_side_tx, b_rx)) = control_pair();
        drop(b_rx);
        drop(b_side_tx);

        // The decoder task notices the dropped output receiver only after
        // one message passes through it.
        let msg = ControlMessage::Heartbeat {
            session_id: 1,
            timestamp_ms: 0,
        };
        let _ = a_tx.send(msg.clone()).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(
            a_tx.send(msg).await.unwrap_err(),
            FlowLayError::TransportClosed("control peer gone".into())
        );
    }
}
