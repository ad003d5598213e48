//! In-process test double for [`crate::transport::Communicator`].
//!
//! Lets the RPC layer, transaction/page managers, and session logic be
//! driven by integration tests without a real websocket — the same role
//! the teacher's `test-util` crate plays for its own protocol tests, just
//! folded into this crate behind the `test-support` feature instead of a
//! sibling workspace member, since the seam here is a single trait rather
//! than a whole test server.
//!
//! Only available when running this crate's own tests or when a dependent
//! enables `test-support`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::error::{HostError, Result};
use crate::transport::{Communicator, SocketEvent};

/// A [`Communicator`] double that records every outbound payload and lets a
/// test inject inbound messages/close events on demand.
pub struct FakeCommunicator {
    instance_id: Uuid,
    sent: Mutex<Vec<Value>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    fail_sends: AtomicBool,
    fail_pings: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    in_flight_sends: AtomicUsize,
    peak_in_flight_sends: AtomicUsize,
}

impl FakeCommunicator {
    /// Build a fake communicator and the event channel a
    /// [`crate::rpc::RpcClient`] should be bound to via `set_communicator`.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                instance_id: Uuid::new_v4(),
                sent: Mutex::new(Vec::new()),
                events,
                fail_sends: AtomicBool::new(false),
                fail_pings: AtomicBool::new(false),
                send_delay: Mutex::new(None),
                in_flight_sends: AtomicUsize::new(0),
                peak_in_flight_sends: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    /// The largest number of [`Communicator::send`] calls this fake ever had
    /// outstanding at once. A test asserting send linearity expects this to
    /// never exceed 1.
    #[must_use]
    pub fn peak_in_flight_sends(&self) -> usize {
        self.peak_in_flight_sends.load(Ordering::SeqCst)
    }

    /// Every envelope sent through this communicator so far, decoded as
    /// JSON, oldest first.
    pub async fn sent(&self) -> Vec<Value> {
        self.sent.lock().await.clone()
    }

    /// Make every subsequent [`Communicator::send`] fail as if the socket
    /// had dropped mid-write.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent [`Communicator::ping`] fail, simulating an
    /// unresponsive peer.
    pub fn fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Simulate network latency: every subsequent [`Communicator::send`]
    /// waits `delay` before recording the payload and returning, giving a
    /// test a window in which to observe (and coalesce into) further calls
    /// that arrive while one is "in flight".
    pub async fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().await = Some(delay);
    }

    /// Feed a raw inbound payload to the bound [`crate::rpc::RpcClient`] as
    /// if it had arrived over the wire.
    pub fn inject_message(&self, payload: Value) {
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let _ = self.events.send(SocketEvent::Message(bytes));
    }

    /// Simulate the peer closing the connection.
    pub fn inject_close(&self, code: Option<u16>, reason: impl Into<String>) {
        let _ = self.events.send(SocketEvent::Closed {
            code,
            reason: reason.into(),
        });
    }
}

#[async_trait::async_trait]
impl Communicator for FakeCommunicator {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let now_in_flight = self.in_flight_sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight_sends.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = *self.send_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = if self.fail_sends.load(Ordering::SeqCst) {
            Err(HostError::NotConnected)
        } else {
            if let Ok(value) = serde_json::from_slice(payload) {
                self.sent.lock().await.push(value);
            }
            Ok(())
        };

        self.in_flight_sends.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(HostError::Timeout);
        }
        Ok(())
    }

    async fn close(&self) {
        self.inject_close(None, "closed by test");
    }

    fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sent_envelopes() {
        let (fake, _rx) = FakeCommunicator::new();
        fake.send(br#"{"hello":"world"}"#).await.expect("send succeeds");
        let sent = fake.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["hello"], "world");
    }

    #[tokio::test]
    async fn fail_sends_surfaces_not_connected() {
        let (fake, _rx) = FakeCommunicator::new();
        fake.fail_sends(true);
        let result = fake.send(b"{}").await;
        assert!(matches!(result, Err(HostError::NotConnected)));
    }

    #[tokio::test]
    async fn fail_pings_surfaces_timeout() {
        let (fake, _rx) = FakeCommunicator::new();
        fake.fail_pings(true);
        assert!(matches!(fake.ping().await, Err(HostError::Timeout)));
    }
}
