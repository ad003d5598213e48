//! Handler-visible context and the auxiliary operations of spec 4.8.
//!
//! Passed as an explicit first-class argument rather than smuggled through
//! task-local storage — the runtime's design notes call out "no truly
//! global" state even where the upstream implementation leans on
//! process-wide async context for convenience getters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::Result;
use crate::model::{ActionDefinition, Environment, User};
use crate::pending::PendingStore;
use crate::rpc::{HostMethod, RpcClient};

/// Resolved organization info, populated once `INITIALIZE_HOST` succeeds.
#[derive(Clone, Debug, Default)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

/// One log line's worth of arguments, matching the upstream `log(...args)`
/// contract: strings are kept verbatim, everything else is JSON-stringified
/// with 2-space indentation, and an explicit "undefined" becomes that
/// literal string.
#[derive(Debug, Clone)]
pub enum LogArg {
    Str(String),
    Value(Value),
    Undefined,
}

impl From<&str> for LogArg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for LogArg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Serialize> From<Option<T>> for LogArg {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => serde_json::to_value(v).map_or(Self::Undefined, Self::Value),
            None => Self::Undefined,
        }
    }
}

/// Maximum length (in characters) of a single forwarded log line.
const LOG_TRUNCATE_LEN: usize = 10_000;

fn render_log_arg(arg: &LogArg) -> String {
    match arg {
        LogArg::Str(s) => s.clone(),
        LogArg::Undefined => "undefined".to_owned(),
        LogArg::Value(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| "null".to_owned()),
    }
}

/// Join log args the way the upstream `log` helper does, then truncate.
#[must_use]
pub fn render_log_line(args: &[LogArg]) -> String {
    let joined = args
        .iter()
        .map(render_log_arg)
        .collect::<Vec<_>>()
        .join(" ");
    if joined.chars().count() > LOG_TRUNCATE_LEN {
        let mut truncated: String = joined.chars().take(LOG_TRUNCATE_LEN).collect();
        truncated.push_str("... (truncated)");
        truncated
    } else {
        joined
    }
}

/// Configuration for a user-facing notification, delegated to the parent
/// Chronicals object (an external collaborator the core never constructs
/// itself).
#[derive(Clone, Debug, Serialize)]
pub struct NotifyConfig {
    pub message: String,
    pub title: Option<String>,
}

/// Delegate that actually dispatches [`NotifyConfig`] (email, Slack, …).
/// The core only forwards to it.
#[async_trait::async_trait]
pub trait NotifyDelegate: Send + Sync {
    async fn notify(&self, config: NotifyConfig) -> Result<()>;
}

/// A [`NotifyDelegate`] that drops every notification; used where no parent
/// object is configured.
pub struct NoopNotifyDelegate;

#[async_trait::async_trait]
impl NotifyDelegate for NoopNotifyDelegate {
    async fn notify(&self, config: NotifyConfig) -> Result<()> {
        warn!(message = %config.message, "dropping notify: no delegate configured");
        Ok(())
    }
}

/// Redirect target requested by a handler mid-transaction.
#[derive(Clone, Debug, Serialize)]
pub struct RedirectProps {
    pub url: Option<String>,
    pub action: Option<String>,
    pub params: Option<Value>,
}

/// Context passed to every action/page handler invocation.
///
/// Shared between transactions and pages: pages address their loading state
/// at a `pageKey` instead of a `transactionId`, so `scope_id` is generic over
/// both.
pub struct HandlerCtx {
    pub scope_id: String,
    pub user: User,
    pub params: Value,
    pub environment: Environment,
    pub organization: Organization,
    pub action: Option<ActionDefinition>,
    log_index: Arc<AtomicU64>,
    rpc: Arc<RpcClient>,
    pending: Arc<PendingStore>,
    notify_delegate: Arc<dyn NotifyDelegate>,
    max_resend_attempts: u32,
    retry_interval: Duration,
}

impl HandlerCtx {
    #[must_use]
    #[expect(clippy::too_many_arguments, reason = "mirrors the collaborators every handler invocation needs wired in")]
    pub fn new(
        scope_id: String,
        user: User,
        params: Value,
        environment: Environment,
        organization: Organization,
        action: Option<ActionDefinition>,
        rpc: Arc<RpcClient>,
        pending: Arc<PendingStore>,
        notify_delegate: Arc<dyn NotifyDelegate>,
        max_resend_attempts: u32,
        retry_interval: Duration,
    ) -> Self {
        Self {
            scope_id,
            user,
            params,
            environment,
            organization,
            action,
            log_index: Arc::new(AtomicU64::new(0)),
            rpc,
            pending,
            notify_delegate,
            max_resend_attempts,
            retry_interval,
        }
    }

    /// Emit a log line for this scope. `index` is assigned here (per-scope
    /// monotonic) so logs stay ordered across network races, per spec
    /// invariant 5: the orchestrator sorts by this index rather than by
    /// arrival order.
    #[instrument(skip(self, args))]
    pub async fn log(&self, args: &[LogArg]) -> Result<()> {
        let index = self.log_index.fetch_add(1, Ordering::SeqCst);
        let data = render_log_line(args);
        let timestamp = crate::time::now_millis();
        self.rpc
            .send_with_retry(
                HostMethod::SendLog,
                serde_json::json!({
                    "transactionId": self.scope_id,
                    "data": data,
                    "index": index,
                    "timestamp": timestamp,
                }),
                self.max_resend_attempts,
                self.retry_interval,
            )
            .await?;
        Ok(())
    }

    /// Update the loading state for this scope, recording it for replay and
    /// forwarding it to the orchestrator.
    pub async fn set_loading(&self, state: Value) -> Result<()> {
        self.pending.set_loading(self.scope_id.clone(), state.clone()).await;
        let mut payload = state;
        if let Value::Object(ref mut map) = payload {
            map.insert("transactionId".into(), Value::String(self.scope_id.clone()));
        }
        self.rpc
            .send_with_retry(HostMethod::SendLoadingCall, payload, self.max_resend_attempts, self.retry_interval)
            .await?;
        Ok(())
    }

    /// Request a client-side redirect. Unsupported when the host is running
    /// in single-shot ("demo") mode, matching the upstream restriction.
    pub async fn redirect(&self, props: RedirectProps) -> Result<()> {
        let mut payload = serde_json::to_value(props)?;
        if let Value::Object(ref mut map) = payload {
            map.insert("transactionId".into(), Value::String(self.scope_id.clone()));
        }
        self.rpc
            .send_with_retry(HostMethod::SendRedirect, payload, self.max_resend_attempts, self.retry_interval)
            .await?;
        Ok(())
    }

    /// Dispatch a notification through the configured [`NotifyDelegate`].
    pub async fn notify(&self, config: NotifyConfig) -> Result<()> {
        self.notify_delegate.notify(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_log_line_keeps_strings_verbatim_and_stringifies_values() {
        let args = vec![
            LogArg::Str("hello".into()),
            LogArg::Value(serde_json::json!({"a": 1})),
            LogArg::Undefined,
        ];
        let line = render_log_line(&args);
        assert!(line.starts_with("hello {\n"));
        assert!(line.ends_with("undefined"));
    }

    #[test]
    fn render_log_line_truncates_long_output() {
        let long = "x".repeat(LOG_TRUNCATE_LEN + 500);
        let line = render_log_line(&[LogArg::Str(long)]);
        assert!(line.ends_with("... (truncated)"));
        assert!(line.chars().count() < LOG_TRUNCATE_LEN + 50);
    }
}
