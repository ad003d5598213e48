//! The I/O builder's core-facing seam.
//!
//! The ergonomic surface handlers use to prompt for input (`io.input.text`,
//! `io.display.*`, grouping helpers) is out of scope — it is the
//! "handler-authoring ergonomic surface" named in the runtime's non-goals.
//! What the core owns is the thin collaborator interface this module
//! defines: a `send` callback that pushes a render instruction outward, and
//! an inbound-response seam a response handler resolves when the
//! orchestrator answers. Treated as `Future<void>`/`Future<Value>` per the
//! runtime's design notes on the thenable-not-`Promise` I/O group.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{HostError, Result};

type SendFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type SendCallback = dyn Fn(Value) -> SendFuture + Send + Sync;

/// What became of a pending I/O prompt.
enum Outcome {
    Value(Value),
    Canceled,
    Closed,
}

struct Pending {
    tx: tokio::sync::oneshot::Sender<Outcome>,
}

/// Per-transaction (or per-page) handle to the I/O builder's render path.
///
/// Holds whatever `inlineActionKeys` the I/O builder registered so the
/// owning manager can drop them on close; the registration path itself is
/// intentionally not exercised by default (see the runtime's design notes).
pub struct IoClient {
    on_send: Arc<SendCallback>,
    pending: Mutex<Option<Pending>>,
    inline_action_keys: Mutex<Vec<String>>,
}

impl IoClient {
    /// Construct a client around the manager-provided `send` callback.
    pub fn new<F, Fut>(on_send: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            on_send: Arc::new(move |value| Box::pin(on_send(value)) as SendFuture),
            pending: Mutex::new(None),
            inline_action_keys: Mutex::new(Vec::new()),
        }
    }

    /// Push a render instruction outward via the owning manager's callback.
    ///
    /// # Errors
    /// Propagates whatever the callback returns, typically
    /// [`HostError::RenderError`] or a transport failure.
    pub async fn send(&self, instruction: Value) -> Result<()> {
        (self.on_send)(instruction).await
    }

    /// Await the orchestrator's response to the most recent `send`.
    ///
    /// Only one prompt may be outstanding at a time, matching the invariant
    /// that `SEND_IO_CALL` messages for a transaction are strictly
    /// sequential.
    ///
    /// # Errors
    /// Returns [`HostError::Canceled`] if [`IoClient::cancel`] is called
    /// first, or [`HostError::TransactionClosed`] if [`IoClient::close`] is.
    pub async fn await_response(&self) -> Result<Value> {
        let rx = {
            let (tx, rx) = tokio::sync::oneshot::channel();
            *self.pending.lock().await = Some(Pending { tx });
            rx
        };
        match rx.await {
            Ok(Outcome::Value(value)) => Ok(value),
            Ok(Outcome::Canceled) => Err(HostError::Canceled),
            Ok(Outcome::Closed) => Err(HostError::TransactionClosed),
            Err(_) => Err(HostError::TransactionClosed),
        }
    }

    /// Resolve the outstanding prompt with the orchestrator's `IO_RESPONSE`.
    pub async fn resolve(&self, value: Value) {
        if let Some(pending) = self.pending.lock().await.take() {
            let _ = pending.tx.send(Outcome::Value(value));
        }
    }

    /// Reject the outstanding prompt because the orchestrator canceled it.
    pub async fn cancel(&self) {
        if let Some(pending) = self.pending.lock().await.take() {
            let _ = pending.tx.send(Outcome::Canceled);
        }
    }

    /// Reject the outstanding prompt because the owning transaction/page
    /// closed.
    pub async fn close(&self) {
        if let Some(pending) = self.pending.lock().await.take() {
            let _ = pending.tx.send(Outcome::Closed);
        }
    }

    /// Record an inline-action key the I/O builder registered for this
    /// client. Preserved as a hook; the registration path is not exercised
    /// by default.
    pub async fn register_inline_action_key(&self, key: impl Into<String>) {
        self.inline_action_keys.lock().await.push(key.into());
    }

    /// Inline-action keys registered so far, for the owning manager to drop
    /// on close.
    pub async fn inline_action_keys(&self) -> Vec<String> {
        self.inline_action_keys.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_completes_await_response() {
        let client = Arc::new(IoClient::new(|_v| async { Ok(()) }));
        let waiter = Arc::clone(&client);
        let handle = tokio::spawn(async move { waiter.await_response().await });
        // Give the spawned task a chance to register its pending slot.
        tokio::task::yield_now().await;
        client.resolve(Value::String("answer".into())).await;
        let result = handle.await.expect("task completes").expect("resolves");
        assert_eq!(result, Value::String("answer".into()));
    }

    #[tokio::test]
    async fn cancel_rejects_with_canceled() {
        let client = Arc::new(IoClient::new(|_v| async { Ok(()) }));
        let waiter = Arc::clone(&client);
        let handle = tokio::spawn(async move { waiter.await_response().await });
        tokio::task::yield_now().await;
        client.cancel().await;
        let result = handle.await.expect("task completes");
        assert!(matches!(result, Err(HostError::Canceled)));
    }
}
