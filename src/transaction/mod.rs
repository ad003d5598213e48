//! Transaction lifecycle (spec component 4.4).
//!
//! One [`TransactionManager`] per [`crate::session::HostSession`] owns every
//! live [`Transaction`]: the map itself *is* the io-response-handler map
//! invariant 1 talks about — a transaction with no entry here cannot
//! receive an `IO_RESPONSE`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::ctx::{HandlerCtx, NotifyDelegate, Organization};
use crate::error::{HostError, Result};
use crate::io_client::IoClient;
use crate::model::{ActionDefinition, Environment, RouteKind, RouteTree, User};
use crate::pending::PendingStore;
use crate::rpc::{HostMethod, RpcClient};
use crate::tagged;

/// Inbound shape of a `START_TRANSACTION` call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionInput {
    pub transaction_id: String,
    pub action: ActionRef,
    pub user: User,
    pub environment: Environment,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub params_meta: Option<Value>,
    #[serde(default)]
    pub display_resolves_immediately: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActionRef {
    pub slug: String,
}

/// Hook invoked before a handler failure is turned into a `FAILURE`
/// envelope. May return an override message for the envelope.
#[async_trait::async_trait]
pub trait OnErrorHook: Send + Sync {
    async fn on_error(
        &self,
        error: &HostError,
        route_slug: &str,
        params: &Value,
        environment: Environment,
        user: &User,
        organization: &Organization,
    ) -> Option<String>;
}

/// A no-op [`OnErrorHook`], used when the caller doesn't configure one.
pub struct NoopOnErrorHook;

#[async_trait::async_trait]
impl OnErrorHook for NoopOnErrorHook {
    async fn on_error(
        &self,
        _error: &HostError,
        _route_slug: &str,
        _params: &Value,
        _environment: Environment,
        _user: &User,
        _organization: &Organization,
    ) -> Option<String> {
        None
    }
}

/// Callback invoked once a transaction's terminal outcome is known, for the
/// single-shot HTTP adapter to resolve its awaited request.
#[async_trait::async_trait]
pub trait CompletionCallback: Send + Sync {
    async fn completed(&self, transaction_id: &str);
}

/// Sub-state of a live transaction, tracking the deferred-close interplay
/// between `displayResolvesImmediately` and a late `CLOSE_TRANSACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    AwaitingDisplayResolution,
}

struct Entry {
    slug: String,
    user: User,
    environment: Environment,
    io: Arc<IoClient>,
    phase: Mutex<Phase>,
    closed: AtomicBool,
}

/// Owns every live transaction for one host session.
pub struct TransactionManager {
    routes: Arc<RwLock<RouteTree>>,
    rpc: Arc<RpcClient>,
    pending: Arc<PendingStore>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    shutting_down: Arc<AtomicBool>,
    notify_delegate: Arc<dyn NotifyDelegate>,
    on_error: Arc<dyn OnErrorHook>,
    organization: Arc<RwLock<Organization>>,
    completion: Option<Arc<dyn CompletionCallback>>,
    max_resend_attempts: u32,
    retry_interval: std::time::Duration,
}

impl TransactionManager {
    #[must_use]
    #[expect(clippy::too_many_arguments, reason = "mirrors the collaborators every transaction needs wired in")]
    pub fn new(
        routes: Arc<RwLock<RouteTree>>,
        rpc: Arc<RpcClient>,
        pending: Arc<PendingStore>,
        shutting_down: Arc<AtomicBool>,
        organization: Arc<RwLock<Organization>>,
        notify_delegate: Arc<dyn NotifyDelegate>,
        on_error: Arc<dyn OnErrorHook>,
        completion: Option<Arc<dyn CompletionCallback>>,
        max_resend_attempts: u32,
        retry_interval: std::time::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            routes,
            rpc,
            pending,
            entries: Mutex::new(HashMap::new()),
            shutting_down,
            notify_delegate,
            on_error,
            organization,
            completion,
            max_resend_attempts,
            retry_interval,
        })
    }

    /// Number of transactions currently holding an io-response handler.
    pub async fn live_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Handle an inbound `START_TRANSACTION`. Spawns the handler invocation
    /// as a background task and returns immediately — acking receipt, not
    /// completion, matches the duplex nature of the conversation that
    /// follows.
    #[instrument(skip(self, input), fields(transaction_id = %input.transaction_id))]
    pub async fn start_transaction(self: &Arc<Self>, input: StartTransactionInput) {
        if self.shutting_down.load(Ordering::SeqCst) {
            info!("dropping START_TRANSACTION: shutdown in progress");
            return;
        }
        if self.entries.lock().await.contains_key(&input.transaction_id) {
            warn!("ignoring duplicate START_TRANSACTION");
            return;
        }

        let Some(route) = self.routes.read().await.get(&input.action.slug) else {
            warn!(slug = %input.action.slug, "no handler registered for action slug");
            return;
        };
        let handler = match &route.kind {
            RouteKind::Action(h) => Arc::clone(h),
            RouteKind::Page(..) => {
                warn!(slug = %input.action.slug, "route is a page, not an action");
                return;
            }
        };

        let transaction_id = input.transaction_id.clone();
        let manager = Arc::clone(self);
        let rpc_for_io = Arc::clone(&self.rpc);
        let pending_for_io = Arc::clone(&self.pending);
        let io_transaction_id = transaction_id.clone();
        let max_resend_attempts = self.max_resend_attempts;
        let retry_interval = self.retry_interval;
        let io = Arc::new(IoClient::new(move |instruction| {
            let rpc = Arc::clone(&rpc_for_io);
            let pending = Arc::clone(&pending_for_io);
            let transaction_id = io_transaction_id.clone();
            async move {
                pending.set_io(transaction_id.clone(), instruction.clone()).await;
                let result = rpc
                    .send_with_retry(
                        HostMethod::SendIoCall,
                        serde_json::json!({
                            "transactionId": transaction_id,
                            "ioCall": instruction.to_string(),
                        }),
                        max_resend_attempts,
                        retry_interval,
                    )
                    .await?;
                if result.get("type").and_then(Value::as_str) == Some("ERROR") {
                    let message = result
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("render error")
                        .to_owned();
                    return Err(HostError::RenderError(message));
                }
                pending.remove_io(&transaction_id).await;
                pending.remove_loading(&transaction_id).await;
                Ok(())
            }
        }));

        let entry = Arc::new(Entry {
            slug: input.action.slug.clone(),
            user: input.user.clone(),
            environment: input.environment,
            io: Arc::clone(&io),
            phase: Mutex::new(Phase::Running),
            closed: AtomicBool::new(false),
        });
        self.entries.lock().await.insert(transaction_id.clone(), Arc::clone(&entry));

        let params = tagged::decode_params(input.params, input.params_meta.as_ref());
        let organization = self.organization.read().await.clone();
        let action_def = ActionDefinition {
            group_slug: route.group.clone(),
            slug: route.slug.clone(),
            name: route.name.clone(),
            description: route.description.clone(),
            unlisted: route.flags.unlisted,
            access: route.access.clone(),
        };
        let ctx = HandlerCtx::new(
            transaction_id.clone(),
            input.user,
            params,
            input.environment,
            organization,
            Some(action_def),
            Arc::clone(&self.rpc),
            Arc::clone(&self.pending),
            Arc::clone(&self.notify_delegate),
            self.max_resend_attempts,
            self.retry_interval,
        );

        let display_resolves_immediately = input.display_resolves_immediately;
        tokio::spawn(async move {
            manager
                .run_transaction(transaction_id, handler, io, ctx, display_resolves_immediately)
                .await;
        });
    }

    #[instrument(skip(self, handler, io, ctx))]
    async fn run_transaction(
        self: Arc<Self>,
        transaction_id: String,
        handler: Arc<dyn crate::model::ActionHandler>,
        io: Arc<IoClient>,
        ctx: HandlerCtx,
        display_resolves_immediately: bool,
    ) {
        let slug = ctx.action.as_ref().map(|a| a.slug.clone()).unwrap_or_default();
        let params = ctx.params.clone();
        let environment = ctx.environment;
        let user = ctx.user.clone();
        let organization = ctx.organization.clone();

        let outcome = handler.call(Arc::clone(&io), ctx).await;

        let envelope = match outcome {
            Ok(data) => Some(serde_json::json!({
                "schemaVersion": 1,
                "status": "SUCCESS",
                "data": data,
                "meta": tagged::empty_meta(),
            })),
            Err(HostError::Canceled) => None,
            Err(other) => {
                let override_message = self
                    .on_error
                    .on_error(&other, &slug, &params, environment, &user, &organization)
                    .await;
                let message = override_message.unwrap_or_else(|| other.to_string());
                Some(serde_json::json!({
                    "schemaVersion": 1,
                    "status": "FAILURE",
                    "data": {
                        "error": slug,
                        "message": message,
                    },
                }))
            }
        };

        if let Some(envelope) = envelope {
            let send_result = self
                .rpc
                .send_with_retry(
                    HostMethod::MarkTransactionComplete,
                    serde_json::json!({
                        "transactionId": transaction_id,
                        "resultStatus": envelope.get("status").cloned().unwrap_or(Value::Null),
                        "result": envelope.to_string(),
                    }),
                    self.max_resend_attempts,
                    self.retry_interval,
                )
                .await;
            if let Err(err) = send_result {
                warn!(%transaction_id, error = %err, "failed to deliver MARK_TRANSACTION_COMPLETE");
            }

            if let Some(completion) = &self.completion {
                completion.completed(&transaction_id).await;
            }
        }

        if display_resolves_immediately {
            let entry = self.entries.lock().await.get(&transaction_id).cloned();
            if let Some(entry) = entry {
                *entry.phase.lock().await = Phase::AwaitingDisplayResolution;
            }
        } else {
            self.close_transaction(&transaction_id).await;
        }
    }

    /// Handle an inbound `CLOSE_TRANSACTION`: reject the pending prompt with
    /// `CANCELED`, mark the client closed for future I/O, and forget all
    /// owned state.
    #[instrument(skip(self))]
    pub async fn close_transaction(&self, transaction_id: &str) {
        let Some(entry) = self.entries.lock().await.remove(transaction_id) else {
            return;
        };
        entry.closed.store(true, Ordering::SeqCst);
        entry.io.cancel().await;
        self.pending.remove_io(transaction_id).await;
        self.pending.remove_loading(transaction_id).await;
        if let Some(completion) = &self.completion {
            completion.completed(transaction_id).await;
        }
    }

    /// Route an inbound `IO_RESPONSE` to the owning transaction's client.
    #[instrument(skip(self, value))]
    pub async fn route_io_response(&self, transaction_id: &str, value: Value) {
        let entries = self.entries.lock().await;
        if let Some(entry) = entries.get(transaction_id) {
            entry.io.resolve(value).await;
        } else {
            warn!(%transaction_id, "IO_RESPONSE for unknown or closed transaction");
        }
    }
}
