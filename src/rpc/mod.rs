//! Duplex RPC over the framed transport (spec component 4.2).
//!
//! Two symmetric method dictionaries: [`HostMethod`] (what the host may
//! call on the peer) and [`SdkMethod`] (what the peer may call on the
//! host). Calls are correlated by a monotonic id internal to this layer,
//! independent of the transport's own chunk/ack bookkeeping.

mod methods;
pub mod schema;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use methods::{HostMethod, SdkMethod};
use schema::{Direction, SchemaRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{instrument, trace, warn};

use crate::error::{HostError, Result};
use crate::transport::{Communicator, SocketEvent};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Call { id: u64, method: String, inputs: Value },
    Response { id: u64, output: Value },
    Error { id: u64, message: String },
}

type InboundFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type InboundHandler = dyn Fn(Value) -> InboundFuture + Send + Sync;

struct Binding {
    transport: Arc<dyn Communicator>,
    reader: tokio::task::JoinHandle<()>,
}

/// Handle the peer calls a method the caller didn't expect, reporting
/// `(code, reason)` of the socket closing when the reader loop ends.
type CloseNotice = (Option<u16>, String);

struct RpcState {
    binding: Option<Binding>,
    close_waiters: Vec<oneshot::Sender<CloseNotice>>,
}

/// Correlates RPC calls across a (possibly rebinding) transport.
pub struct RpcClient {
    state: Mutex<RpcState>,
    next_id: AtomicU64,
    pending_calls: Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, HostError>>>>,
    inbound_handlers: Mutex<HashMap<SdkMethod, Arc<InboundHandler>>>,
    schemas: SchemaRegistry,
    base_timeout: Duration,
}

impl RpcClient {
    #[must_use]
    pub fn new(schemas: SchemaRegistry, base_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RpcState {
                binding: None,
                close_waiters: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            pending_calls: Mutex::new(HashMap::new()),
            inbound_handlers: Mutex::new(HashMap::new()),
            schemas,
            base_timeout,
        })
    }

    /// Register the handler invoked for inbound calls to `method`.
    pub async fn register_handler<F, Fut>(&self, method: SdkMethod, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let boxed: Arc<InboundHandler> = Arc::new(move |value| Box::pin(handler(value)) as InboundFuture);
        self.inbound_handlers.lock().await.insert(method, boxed);
    }

    /// Rebind to a fresh transport after reconnect. Pending caller promises
    /// that already failed (from the old transport closing) are not
    /// retroactively resolved — only calls issued after this point use the
    /// new binding.
    pub async fn set_communicator(
        self: &Arc<Self>,
        transport: Arc<dyn Communicator>,
        mut events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        let client = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    SocketEvent::Message(bytes) => client.handle_inbound_bytes(&bytes).await,
                    SocketEvent::Closed { code, reason } => {
                        client.fail_all_pending().await;
                        let mut state = client.state.lock().await;
                        for waiter in state.close_waiters.drain(..) {
                            let _ = waiter.send((code, reason.clone()));
                        }
                        break;
                    }
                }
            }
        });

        let mut state = self.state.lock().await;
        if let Some(old) = state.binding.take() {
            old.reader.abort();
        }
        state.binding = Some(Binding { transport, reader });
    }

    /// Resolve once the current transport reports a close.
    pub async fn wait_closed(&self) -> CloseNotice {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.state.lock().await.close_waiters.push(tx);
            rx
        };
        rx.await.unwrap_or((None, "rpc client dropped".into()))
    }

    /// Ping the currently bound transport, for the session's liveness loop.
    ///
    /// # Errors
    /// Propagates [`HostError::NotConnected`]/[`HostError::Timeout`] from
    /// [`Transport::ping`].
    pub async fn ping_current(&self) -> Result<()> {
        self.current_transport().await?.ping().await
    }

    /// Close the currently bound transport, if any, without waiting for a
    /// peer ack — used when a liveness check fails.
    pub async fn close_current(&self) {
        if let Ok(transport) = self.current_transport().await {
            transport.close().await;
        }
    }

    async fn current_transport(&self) -> Result<Arc<dyn Communicator>> {
        self.state
            .lock()
            .await
            .binding
            .as_ref()
            .map(|b| Arc::clone(&b.transport))
            .ok_or(HostError::NotConnected)
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending_calls.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(HostError::NotConnected));
        }
    }

    async fn handle_inbound_bytes(&self, bytes: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "dropping malformed RPC envelope");
                return;
            }
        };
        match envelope {
            Envelope::Call { id, method, inputs } => self.handle_inbound_call(id, &method, inputs).await,
            Envelope::Response { id, output } => {
                if let Some(tx) = self.pending_calls.lock().await.remove(&id) {
                    let _ = tx.send(Ok(output));
                }
            }
            Envelope::Error { id, message } => {
                if let Some(tx) = self.pending_calls.lock().await.remove(&id) {
                    let _ = tx.send(Err(HostError::RenderError(message)));
                }
            }
        }
    }

    #[instrument(skip(self, inputs))]
    async fn handle_inbound_call(&self, id: u64, method: &str, inputs: Value) {
        let Some(parsed) = SdkMethod::parse(method) else {
            self.respond_error(id, format!("unknown method: {method}")).await;
            return;
        };
        if let Err(e) = self.schemas.validate(method, Direction::Input, &inputs) {
            self.respond_error(id, e.to_string()).await;
            return;
        }
        let handler = self.inbound_handlers.lock().await.get(&parsed).cloned();
        let Some(handler) = handler else {
            self.respond_error(id, format!("no handler registered for {method}")).await;
            return;
        };
        match handler(inputs).await {
            Ok(output) => {
                if let Err(e) = self.schemas.validate(method, Direction::Output, &output) {
                    self.respond_error(id, e.to_string()).await;
                    return;
                }
                self.respond_ok(id, output).await;
            }
            Err(e) => self.respond_error(id, e.to_string()).await,
        }
    }

    async fn respond_ok(&self, id: u64, output: Value) {
        self.send_envelope(&Envelope::Response { id, output }).await;
    }

    async fn respond_error(&self, id: u64, message: String) {
        self.send_envelope(&Envelope::Error { id, message }).await;
    }

    async fn send_envelope(&self, envelope: &Envelope) {
        let Ok(transport) = self.current_transport().await else {
            warn!("dropping outbound RPC envelope: no transport bound");
            return;
        };
        if let Ok(bytes) = serde_json::to_vec(envelope) {
            if let Err(err) = transport.send(&bytes).await {
                warn!(error = %err, "failed to deliver RPC envelope");
            }
        }
    }

    /// Issue a schema-validated round trip to the peer.
    ///
    /// `timeout_factor` scales the base response timeout linearly, for
    /// callers implementing the outer retry policy of spec 4.9.
    ///
    /// # Errors
    /// [`HostError::SchemaInvalid`] if `inputs`/the response fail
    /// validation, [`HostError::NotConnected`] if unbound, or
    /// [`HostError::Timeout`] if no response arrives in time.
    #[instrument(skip(self, inputs))]
    pub async fn send(&self, method: HostMethod, inputs: Value, timeout_factor: u32) -> Result<Value> {
        self.schemas
            .validate(method.as_str(), Direction::Input, &inputs)?;

        let transport = self.current_transport().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_calls.lock().await.insert(id, tx);

        let envelope = Envelope::Call {
            id,
            method: method.as_str().to_owned(),
            inputs,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        if let Err(err) = transport.send(&bytes).await {
            self.pending_calls.lock().await.remove(&id);
            return Err(err);
        }

        let wait = self.base_timeout.saturating_mul(timeout_factor.max(1));
        let outcome = tokio::time::timeout(wait, rx).await;
        match outcome {
            Ok(Ok(Ok(output))) => {
                self.schemas
                    .validate(method.as_str(), Direction::Output, &output)?;
                trace!(method = %method, "rpc call succeeded");
                Ok(output)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(HostError::NotConnected),
            Err(_) => {
                self.pending_calls.lock().await.remove(&id);
                Err(HostError::Timeout)
            }
        }
    }

    /// The outer host-side retry policy of spec 4.9: only a [`HostError::Timeout`]
    /// is retried, with `retry_interval * attempt_number` linear backoff
    /// awaited between attempts; any other error is rethrown immediately.
    /// Exhausting `max_attempts` surfaces [`HostError::MaxRetries`].
    ///
    /// Resolves the upstream bug noted in spec 9(b): the backoff sleep is
    /// always awaited, never fired and forgotten.
    ///
    /// # Errors
    /// See above: propagates the first non-timeout error, or
    /// [`HostError::MaxRetries`] once the attempt budget is spent.
    #[instrument(skip(self, inputs))]
    pub async fn send_with_retry(
        &self,
        method: HostMethod,
        inputs: Value,
        max_attempts: u32,
        retry_interval: Duration,
    ) -> Result<Value> {
        let max_attempts = max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            match self.send(method, inputs.clone(), attempt).await {
                Ok(output) => return Ok(output),
                Err(HostError::Timeout) => {
                    if attempt >= max_attempts {
                        return Err(HostError::MaxRetries);
                    }
                    tokio::time::sleep(retry_interval.saturating_mul(attempt)).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_binding_fails_not_connected() {
        let client = RpcClient::new(schema::default_registry().expect("registry"), Duration::from_millis(50));
        let result = client.send(HostMethod::SendLog, serde_json::json!({}), 1).await;
        assert!(matches!(result, Err(HostError::NotConnected)));
    }

    #[tokio::test]
    async fn unregistered_inbound_method_reports_method_unknown() {
        let client = RpcClient::new(schema::default_registry().expect("registry"), Duration::from_millis(50));
        // No handler registered for OPEN_PAGE; dispatching a synthetic call
        // should short-circuit before ever touching a transport.
        client
            .handle_inbound_call(1, "OPEN_PAGE", serde_json::json!({"pageKey": "p1", "page": {"slug": "x"}, "environment": "development"}))
            .await;
    }
}
