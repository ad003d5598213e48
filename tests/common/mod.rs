//! Shared scaffolding for the integration test binaries.
//!
//! Wraps [`chronicals_host::test_support::FakeCommunicator`] with the bit
//! every scenario needs: a background task that plays orchestrator,
//! answering outbound calls the way a real one would so [`RpcClient::send`]
//! never has to wait for a human.

#![expect(clippy::unwrap_used, reason = "test code can panic")]
#![expect(clippy::expect_used, reason = "test code can panic")]
#![expect(clippy::indexing_slicing, reason = "test code with known bounds")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chronicals_host::rpc::{RpcClient, schema};
use chronicals_host::test_support::FakeCommunicator;
use serde_json::Value;
use tokio::sync::Mutex;

/// Attempt budget used throughout the scenarios: enough to observe a retry
/// without making a deliberately-unanswered call take long to fail.
pub const TEST_MAX_ATTEMPTS: u32 = 3;
/// Backoff between resend attempts, short enough to keep tests fast.
pub const TEST_RETRY_INTERVAL: Duration = Duration::from_millis(5);
/// Base per-attempt RPC timeout.
pub const TEST_BASE_TIMEOUT: Duration = Duration::from_millis(40);

/// Build an [`RpcClient`] bound to a fresh [`FakeCommunicator`].
pub async fn bind_rpc() -> (Arc<RpcClient>, Arc<FakeCommunicator>) {
    let schemas = schema::default_registry().expect("default schema registry is well-formed");
    let rpc = RpcClient::new(schemas, TEST_BASE_TIMEOUT);
    let (fake, events_rx) = FakeCommunicator::new();
    rpc.set_communicator(fake.clone(), events_rx).await;
    (rpc, fake)
}

/// Spawn a background task that plays orchestrator: polls the fake's sent
/// log for unanswered outbound calls and, when `responder` recognizes the
/// method, injects a `response` envelope for it. Returns the task handle so
/// the caller can abort it once the scenario is done.
pub fn spawn_auto_responder(
    fake: Arc<FakeCommunicator>,
    responder: impl Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let answered: Mutex<HashSet<u64>> = Mutex::new(HashSet::new());
        loop {
            for call in fake.sent().await {
                if call.get("type").and_then(Value::as_str) != Some("call") {
                    continue;
                }
                let Some(id) = call.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                if answered.lock().await.contains(&id) {
                    continue;
                }
                let method = call.get("method").and_then(Value::as_str).unwrap_or_default();
                let inputs = call.get("inputs").cloned().unwrap_or(Value::Null);
                if let Some(output) = responder(method, &inputs) {
                    fake.inject_message(serde_json::json!({
                        "type": "response",
                        "id": id,
                        "output": output,
                    }));
                    answered.lock().await.insert(id);
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
}

/// How many outbound calls to `method` have been recorded so far.
pub async fn call_count(fake: &FakeCommunicator, method: &str) -> usize {
    fake.sent()
        .await
        .iter()
        .filter(|v| {
            v.get("type").and_then(Value::as_str) == Some("call")
                && v.get("method").and_then(Value::as_str) == Some(method)
        })
        .count()
}

/// Poll until at least one call to `method` has been recorded, or `attempts`
/// polls have elapsed without one (for asserting a call never happens).
pub async fn wait_for_call_count_at_least(
    fake: &FakeCommunicator,
    method: &str,
    at_least: usize,
    attempts: u32,
) -> usize {
    for _ in 0..attempts {
        let count = call_count(fake, method).await;
        if count >= at_least {
            return count;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    call_count(fake, method).await
}
