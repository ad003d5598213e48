//! Host session state machine, reconnect loop, and shutdown coordinator
//! (spec components 4.6, 4.7, and the Resend Engine/Auxiliary ops of 4.9).
//!
//! One [`HostSession`] owns the single logical connection to the
//! orchestrator across its whole lifetime, including every reconnect. The
//! state machine is `Idle -> Connecting -> Initializing -> Serving ->
//! {Reconnecting, Draining, Closed}`, mirroring the bootstrap/accept-loop
//! shape the daemon's own server runtime uses, generalized here to a
//! reconnecting client instead of an accept loop.

mod resend;
mod shutdown;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::ctx::{NoopNotifyDelegate, NotifyDelegate, Organization};
use crate::error::{HostError, Result};
use crate::model::{ActionGroup, RouteSource, RouteTree, derive_definitions};
use crate::page::{OpenPageInput, PageManager};
use crate::pending::PendingStore;
use crate::rpc::{HostMethod, RpcClient, SdkMethod, schema};
use crate::transaction::{
    CompletionCallback, NoopOnErrorHook, OnErrorHook, StartTransactionInput, TransactionManager,
};
use crate::transport::Transport;

pub use shutdown::ShutdownMode;

/// Current phase of the session's connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Initializing,
    Serving,
    Reconnecting,
    Draining,
    Closed,
    /// Terminal: the initial connection attempt failed, or `INITIALIZE_HOST`
    /// returned a fatal outcome (spec 4.6's `Connecting`/`Initializing` →
    /// `Failed` transitions). Never entered for a transport drop after the
    /// session has already served at least once — that goes through
    /// `Reconnecting` instead.
    Failed,
}

/// Construction parameters for a [`HostSession`], gathering every external
/// collaborator the core treats as opaque.
pub struct HostSessionConfig {
    pub config: HostConfig,
    pub routes: RouteTree,
    pub groups: Vec<ActionGroup>,
    pub route_source: Arc<dyn RouteSource>,
    pub on_error: Arc<dyn OnErrorHook>,
    pub notify_delegate: Arc<dyn NotifyDelegate>,
    pub completion: Option<Arc<dyn CompletionCallback>>,
}

impl HostSessionConfig {
    /// Construct with every optional collaborator defaulted to its no-op and
    /// no declared groups.
    #[must_use]
    pub fn new(config: HostConfig, routes: RouteTree) -> Self {
        Self {
            config,
            routes,
            groups: Vec::new(),
            route_source: Arc::new(crate::model::EmptyRouteSource),
            on_error: Arc::new(NoopOnErrorHook),
            notify_delegate: Arc::new(NoopNotifyDelegate),
            completion: None,
        }
    }
}

/// Owns the reconnecting connection to the orchestrator and every
/// collaborator that needs to survive a reconnect: the route tree, the
/// pending-message store, and the transaction/page managers.
pub struct HostSession {
    config: HostConfig,
    instance_id: Uuid,
    routes: Arc<RwLock<RouteTree>>,
    groups: Vec<ActionGroup>,
    route_source: Arc<dyn RouteSource>,
    rpc: Arc<RpcClient>,
    pending: Arc<PendingStore>,
    transactions: Arc<TransactionManager>,
    pages: Arc<PageManager>,
    organization: Arc<RwLock<Organization>>,
    shutting_down: Arc<AtomicBool>,
    state: Mutex<SessionState>,
}

impl HostSession {
    /// Build a session, wiring every collaborator together but opening no
    /// connection yet — call [`HostSession::run`] to start serving.
    ///
    /// # Errors
    /// Propagates [`schema::default_registry`] failures (never expected for
    /// the fixed literal schemas it registers).
    pub fn new(params: HostSessionConfig) -> Result<Arc<Self>> {
        let schemas = schema::default_registry()?;
        let rpc = RpcClient::new(schemas, params.config.send_timeout);
        let pending = Arc::new(PendingStore::new());
        let routes = Arc::new(RwLock::new(params.routes));
        let organization = Arc::new(RwLock::new(Organization::default()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let transactions = TransactionManager::new(
            Arc::clone(&routes),
            Arc::clone(&rpc),
            Arc::clone(&pending),
            Arc::clone(&shutting_down),
            Arc::clone(&organization),
            Arc::clone(&params.notify_delegate),
            params.on_error,
            params.completion,
            params.config.max_resend_attempts,
            params.config.retry_interval,
        );
        let pages = PageManager::new(
            Arc::clone(&routes),
            Arc::clone(&rpc),
            Arc::clone(&pending),
            Arc::clone(&shutting_down),
            Arc::clone(&organization),
            Arc::clone(&params.notify_delegate),
            params.config.retry_interval,
            params.config.max_resend_attempts,
        );

        Ok(Arc::new(Self {
            config: params.config,
            instance_id: Uuid::new_v4(),
            routes,
            groups: params.groups,
            route_source: params.route_source,
            rpc,
            pending,
            transactions,
            pages,
            organization,
            shutting_down,
            state: Mutex::new(SessionState::Idle),
        }))
    }

    /// Current lifecycle phase, for diagnostics and tests.
    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: SessionState) {
        debug!(?state, "session state transition");
        *self.state.lock().await = state;
    }

    /// Run the session until [`HostSession::safely_close`] or
    /// [`HostSession::immediately_close`] is called, reconnecting on every
    /// transport failure with the configured linear backoff.
    ///
    /// Two outcomes are terminal rather than retried, per spec 4.6's
    /// `Connecting`/`Initializing` → `Failed` transitions: the very first
    /// connection attempt failing for any reason (there is no `Reconnecting`
    /// state to fall back on before the session has ever reached `Serving`),
    /// and [`HostError::Fatal`] from `INITIALIZE_HOST` at any point (an
    /// all-invalid-slug declare, or an explicit `type: "error"` response).
    /// Every other failure — including a later `INITIALIZE_HOST` call timing
    /// out, or the transport simply dropping — is retried forever via the
    /// `Reconnecting` state.
    ///
    /// # Errors
    /// Returns [`HostError::Fatal`] (or the initial connection's own error)
    /// for either terminal outcome above.
    #[instrument(skip(self))]
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.register_handlers().await;

        let mut attempt: u32 = 0;
        let mut ever_served = false;
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                self.set_state(SessionState::Closed).await;
                return Ok(());
            }

            self.set_state(if ever_served {
                SessionState::Reconnecting
            } else {
                SessionState::Connecting
            })
            .await;

            match self.connect_once().await {
                Ok(()) => {
                    ever_served = true;
                    attempt = 0;
                }
                Err(err) => {
                    let fatal = !ever_served || matches!(err, HostError::Fatal(_));
                    if fatal {
                        warn!(error = %err, "connection attempt failed fatally, not retrying");
                        self.set_state(SessionState::Failed).await;
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(error = %err, attempt, "connection attempt failed, reconnecting");
                    tokio::time::sleep(self.config.retry_interval.saturating_mul(attempt.max(1)))
                        .await;
                    continue;
                }
            }

            if self.shutting_down.load(Ordering::SeqCst) {
                self.set_state(SessionState::Closed).await;
                return Ok(());
            }
        }
    }

    #[instrument(skip(self))]
    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let (transport, events_rx) = Transport::connect(
            &self.config.endpoint,
            self.instance_id,
            self.config.api_key.as_deref(),
            self.config.connect_timeout,
            self.config.send_timeout,
            self.config.ping_timeout,
            crate::transport::MAX_FRAME_BYTES,
        )
        .await?;

        self.rpc.set_communicator(Arc::clone(&transport), events_rx).await;
        self.set_state(SessionState::Initializing).await;
        self.initialize_host().await?;
        self.set_state(SessionState::Serving).await;

        resend::replay_pending(self, self.config.max_resend_attempts, self.config.retry_interval).await;

        let ping_task = self.spawn_ping_loop();
        let (code, reason) = self.rpc.wait_closed().await;
        ping_task.abort();
        info!(?code, %reason, "transport closed");
        Ok(())
    }

    fn spawn_ping_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(session.config.ping_interval);
            loop {
                interval.tick().await;
                if session.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let outcome = tokio::time::timeout(
                    session.config.close_unresponsive_connection_timeout,
                    session.rpc.ping_current(),
                )
                .await;
                if !matches!(outcome, Ok(Ok(()))) {
                    warn!("ping failed or timed out; closing unresponsive connection");
                    session.rpc.close_current().await;
                    return;
                }
            }
        })
    }

    #[instrument(skip(self))]
    async fn initialize_host(&self) -> Result<()> {
        let (actions, pages) = {
            let routes = self.routes.read().await;
            derive_definitions(&routes)
        };
        let declared_slug_count = actions.len() + pages.len();
        let output = self
            .rpc
            .send_with_retry(
                HostMethod::InitializeHost,
                serde_json::json!({
                    "instanceId": self.instance_id,
                    "sdkName": env!("CARGO_PKG_NAME"),
                    "sdkVersion": env!("CARGO_PKG_VERSION"),
                    "timestamp": crate::time::now_millis(),
                    "actions": actions,
                    "pages": pages,
                    "groups": self.groups,
                }),
                self.config.max_resend_attempts,
                self.config.retry_interval,
            )
            .await?;

        match evaluate_initialize_response(&output, declared_slug_count) {
            InitializeOutcome::Fatal(message) => return Err(HostError::Fatal(message)),
            InitializeOutcome::Accepted { organization, invalid_slugs, sdk_alert } => {
                for slug in &invalid_slugs {
                    warn!(%slug, "orchestrator reported invalid slug on declare");
                }
                if let Some(alert) = sdk_alert {
                    warn!(%alert, "orchestrator sent an sdkAlert on declare");
                }
                if let Some(org) = organization {
                    let mut organization = self.organization.write().await;
                    organization.id = org.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
                    organization.name =
                        org.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
                }
            }
        }
        Ok(())
    }

    /// Re-walk the configured [`RouteSource`], merge any new routes, and
    /// re-declare via `INITIALIZE_HOST`, debounced by
    /// `reinitializeBatchTimeoutMs` so a burst of filesystem events collapses
    /// into one round trip.
    #[instrument(skip(self))]
    pub async fn handle_actions_change(self: &Arc<Self>) -> Result<()> {
        tokio::time::sleep(self.config.reinitialize_batch_timeout).await;
        let discovered = self.route_source.load().await?;
        if discovered.is_empty() {
            return Ok(());
        }
        {
            let mut routes = self.routes.write().await;
            for route in discovered {
                routes.insert(route);
            }
        }
        self.initialize_host().await
    }

    async fn register_handlers(self: &Arc<Self>) {
        let session = Arc::clone(self);
        self.rpc
            .register_handler(SdkMethod::StartTransaction, move |value| {
                let session = Arc::clone(&session);
                async move {
                    let input: StartTransactionInput = serde_json::from_value(value)?;
                    session.transactions.start_transaction(input).await;
                    Ok(serde_json::json!({"type": "SUCCESS"}))
                }
            })
            .await;

        let session = Arc::clone(self);
        self.rpc
            .register_handler(SdkMethod::IoResponse, move |value| {
                let session = Arc::clone(&session);
                async move {
                    let raw = value
                        .get("value")
                        .and_then(Value::as_str)
                        .ok_or_else(|| HostError::SchemaInvalid("IO_RESPONSE missing value".into()))?;
                    let inner: Value = serde_json::from_str(raw)?;
                    let transaction_id = inner
                        .get("transactionId")
                        .and_then(Value::as_str)
                        .ok_or_else(|| HostError::SchemaInvalid("IO_RESPONSE missing transactionId".into()))?;
                    session.transactions.route_io_response(transaction_id, inner.clone()).await;
                    Ok(Value::Null)
                }
            })
            .await;

        let session = Arc::clone(self);
        self.rpc
            .register_handler(SdkMethod::CloseTransaction, move |value| {
                let session = Arc::clone(&session);
                async move {
                    let transaction_id = value
                        .get("transactionId")
                        .and_then(Value::as_str)
                        .ok_or_else(|| HostError::SchemaInvalid("CLOSE_TRANSACTION missing transactionId".into()))?
                        .to_owned();
                    session.transactions.close_transaction(&transaction_id).await;
                    Ok(Value::Null)
                }
            })
            .await;

        let session = Arc::clone(self);
        self.rpc
            .register_handler(SdkMethod::OpenPage, move |value| {
                let session = Arc::clone(&session);
                async move {
                    let input: OpenPageInput = serde_json::from_value(value)?;
                    session.pages.open_page(input).await
                }
            })
            .await;

        let session = Arc::clone(self);
        self.rpc
            .register_handler(SdkMethod::ClosePage, move |value| {
                let session = Arc::clone(&session);
                async move {
                    let page_key = value
                        .get("pageKey")
                        .and_then(Value::as_str)
                        .ok_or_else(|| HostError::SchemaInvalid("CLOSE_PAGE missing pageKey".into()))?
                        .to_owned();
                    session.pages.close_page(&page_key).await;
                    Ok(Value::Null)
                }
            })
            .await;
    }

    /// Connect exactly once, serve until the transport closes, and return —
    /// never reconnecting on a mid-request drop. Used by the single-shot
    /// HTTP adapter (spec 4.10), which confirms Open Question (c): within
    /// one handled request, a dropped connection ends the request rather
    /// than triggering the persistent-mode reconnect loop [`HostSession::
    /// run`] drives.
    ///
    /// # Errors
    /// Propagates the initial connection/initialization failure, since
    /// there is no reconnect attempt to fall back on here.
    #[instrument(skip(self))]
    pub async fn serve_once(self: &Arc<Self>) -> Result<()> {
        self.register_handlers().await;
        self.set_state(SessionState::Connecting).await;
        self.connect_once().await?;
        self.set_state(SessionState::Closed).await;
        Ok(())
    }

    /// Drain in-flight work before closing: refuse new `START_TRANSACTION`/
    /// `OPEN_PAGE`, let in-flight ones finish, notify the orchestrator via
    /// `BEGIN_HOST_SHUTDOWN`, then close once the configured grace delay
    /// elapses or all work completes, whichever is first.
    #[instrument(skip(self))]
    pub async fn safely_close(self: &Arc<Self>) {
        shutdown::run(self, ShutdownMode::Safely).await;
    }

    /// Tear down immediately: mark shutting down and close the transport
    /// without waiting on in-flight work.
    #[instrument(skip(self))]
    pub async fn immediately_close(self: &Arc<Self>) {
        shutdown::run(self, ShutdownMode::Immediately).await;
    }

    pub(crate) fn shutting_down_flag(&self) -> &Arc<AtomicBool> {
        &self.shutting_down
    }

    pub(crate) fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub(crate) fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    pub(crate) fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub(crate) fn pages(&self) -> &Arc<PageManager> {
        &self.pages
    }

    pub(crate) fn config(&self) -> &HostConfig {
        &self.config
    }
}

/// Outcome of evaluating an `INITIALIZE_HOST` response against spec 4.6/7's
/// all-slugs-invalid rule: an explicit `type: "error"` is always fatal, and
/// so is a `"success"` response whose `invalidSlugs` covers every declared
/// slug (scenario 6). A partially-invalid declare is accepted with
/// warnings, matching "a warning only if at least one slug is valid".
enum InitializeOutcome {
    Accepted {
        organization: Option<Value>,
        invalid_slugs: Vec<String>,
        sdk_alert: Option<String>,
    },
    Fatal(String),
}

fn evaluate_initialize_response(output: &Value, declared_slug_count: usize) -> InitializeOutcome {
    let invalid_slugs: Vec<String> = output
        .get("invalidSlugs")
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(|s| s.as_str()).map(str::to_owned).collect())
        .unwrap_or_default();
    let sdk_alert = output
        .get("sdkAlert")
        .and_then(Value::as_str)
        .map(str::to_owned);

    if output.get("type").and_then(Value::as_str) == Some("error") {
        let message = output
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("route table rejected");
        return InitializeOutcome::Fatal(format!("INITIALIZE_HOST rejected route table: {message}"));
    }

    if declared_slug_count > 0 && invalid_slugs.len() >= declared_slug_count {
        return InitializeOutcome::Fatal(format!(
            "all {} declared slugs were invalid: {}",
            declared_slug_count,
            invalid_slugs.join(", ")
        ));
    }

    InitializeOutcome::Accepted {
        organization: output.get("organization").cloned(),
        invalid_slugs,
        sdk_alert,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_is_always_fatal() {
        let output = serde_json::json!({"type": "error", "message": "nope"});
        assert!(matches!(evaluate_initialize_response(&output, 3), InitializeOutcome::Fatal(_)));
    }

    #[test]
    fn all_invalid_slugs_on_initial_declare_is_fatal() {
        let output = serde_json::json!({"type": "success", "invalidSlugs": ["!bad"]});
        assert!(matches!(evaluate_initialize_response(&output, 1), InitializeOutcome::Fatal(_)));
    }

    #[test]
    fn partially_invalid_slugs_is_accepted_with_warnings() {
        let output = serde_json::json!({"type": "success", "invalidSlugs": ["!bad"]});
        match evaluate_initialize_response(&output, 2) {
            InitializeOutcome::Accepted { invalid_slugs, .. } => assert_eq!(invalid_slugs, vec!["!bad"]),
            InitializeOutcome::Fatal(_) => panic!("expected acceptance"),
        }
    }

    #[test]
    fn no_declared_slugs_never_triggers_all_invalid_fatal() {
        let output = serde_json::json!({"type": "success", "invalidSlugs": []});
        assert!(matches!(
            evaluate_initialize_response(&output, 0),
            InitializeOutcome::Accepted { .. }
        ));
    }
}
