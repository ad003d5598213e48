//! Single-shot HTTP/Lambda adapter (spec component 4.10), feature-gated
//! behind `"http"` for callers that host behind a request/response function
//! rather than a long-lived process.
//!
//! Two request shapes share one endpoint:
//! - `{"httpHostId": ...}` declares the route table once via a plain
//!   `POST /api/hosts/declare` to the orchestrator and returns immediately.
//! - `{"requestId": ...}` serves exactly one transaction/page round trip
//!   inline and returns its terminal result, gated by
//!   `completeHttpRequestDelayMs` so a fast handler doesn't race the
//!   orchestrator's own bookkeeping of the request.
//!
//! No reconnect is attempted within a single request (Open Question (c)):
//! a `{requestId}` call opens a fresh, disposable [`HostSession`] via
//! [`HostSession::serve_once`] rather than [`HostSession::run`], so a
//! mid-request drop ends the request instead of retrying.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::config::HostConfig;
use crate::ctx::NoopNotifyDelegate;
use crate::error::{HostError, Result};
use crate::model::{ActionGroup, EmptyRouteSource, RouteTree, derive_definitions};
use crate::session::{HostSession, HostSessionConfig};
use crate::transaction::{CompletionCallback, NoopOnErrorHook};

/// Shared state behind the axum router.
pub struct SingleShotState {
    config: HostConfig,
    routes: RouteTree,
    groups: Vec<ActionGroup>,
    http_client: Client,
}

impl SingleShotState {
    #[must_use]
    pub fn new(config: HostConfig, routes: RouteTree, groups: Vec<ActionGroup>) -> Arc<Self> {
        Arc::new(Self {
            config,
            routes,
            groups,
            http_client: Client::new(),
        })
    }

    /// Declare the route table once via a plain HTTP POST, for deployments
    /// that never open a persistent socket.
    ///
    /// # Errors
    /// Returns [`HostError::Http`] if the request fails, or
    /// [`HostError::Fatal`] if the orchestrator rejects the declaration.
    #[instrument(skip(self))]
    pub async fn declare(&self, http_host_id: &str) -> Result<()> {
        let (actions, pages) = derive_definitions(&self.routes);
        let base = self.config.http_base_url()?;
        let url = base
            .join("/api/hosts/declare")
            .map_err(|e| HostError::Fatal(format!("invalid declare url: {e}")))?;

        let response = self
            .http_client
            .post(url)
            .json(&serde_json::json!({
                "httpHostId": http_host_id,
                "actions": actions,
                "pages": pages,
                "groups": self.groups,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HostError::Fatal(format!(
                "declare request rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Serve exactly one transaction over a connection scoped to this
    /// request: open a fresh session, run it until its single
    /// [`RequestCompletionCallback`] fires (itself gated by
    /// `completeHttpRequestDelayMs`), then tear the connection down without
    /// ever reconnecting.
    ///
    /// # Errors
    /// Returns [`HostError::Fatal`] if the session cannot be constructed.
    #[instrument(skip(self))]
    async fn serve_one(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let completion = RequestCompletionCallback::new(self.config.complete_http_request_delay, tx);
        let session = HostSession::new(HostSessionConfig {
            config: self.config.clone(),
            routes: self.routes.clone(),
            groups: self.groups.clone(),
            route_source: Arc::new(EmptyRouteSource),
            on_error: Arc::new(NoopOnErrorHook),
            notify_delegate: Arc::new(NoopNotifyDelegate),
            completion: Some(completion),
        })?;

        let run_session = Arc::clone(&session);
        let mut run_handle = tokio::spawn(async move { run_session.serve_once().await });

        tokio::select! {
            _ = rx => {}
            joined = &mut run_handle => {
                run_handle.abort();
                return joined
                    .map_err(|e| HostError::Fatal(format!("single-shot session task panicked: {e}")))?;
            }
        }
        session.immediately_close().await;
        run_handle.abort();
        Ok(())
    }
}

/// Completion callback that resolves a single-shot request's awaited result
/// once its transaction reaches a terminal state, after the configured
/// `completeHttpRequestDelayMs` gate.
pub struct RequestCompletionCallback {
    delay: Duration,
    tx: tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl RequestCompletionCallback {
    #[must_use]
    pub fn new(delay: Duration, tx: tokio::sync::oneshot::Sender<()>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            tx: tokio::sync::Mutex::new(Some(tx)),
        })
    }
}

#[async_trait::async_trait]
impl CompletionCallback for RequestCompletionCallback {
    async fn completed(&self, _transaction_id: &str) {
        tokio::time::sleep(self.delay).await;
        if let Some(tx) = self.tx.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Build the single-shot router: `POST /` dispatches declare-vs-serve-one
/// by payload shape, `GET /` is a bare liveness check.
#[must_use]
pub fn router(state: Arc<SingleShotState>) -> Router {
    Router::new()
        .route("/", post(handle_post))
        .route("/", get(handle_get))
        .with_state(state)
}

async fn handle_get() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

#[instrument(skip(state, body))]
async fn handle_post(
    State(state): State<Arc<SingleShotState>>,
    Json(body): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    if let Some(http_host_id) = body.get("httpHostId").and_then(Value::as_str) {
        return match state.declare(http_host_id).await {
            Ok(()) => (axum::http::StatusCode::OK, Json(serde_json::json!({"type": "SUCCESS"}))),
            Err(err) => {
                warn!(error = %err, "declare failed");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"type": "ERROR", "message": err.to_string()})),
                )
            }
        };
    }

    if body.get("requestId").and_then(Value::as_str).is_some() {
        return match state.serve_one().await {
            Ok(()) => (axum::http::StatusCode::OK, Json(serde_json::json!({"type": "SUCCESS"}))),
            Err(err) => {
                warn!(error = %err, "single-shot request failed");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"type": "ERROR", "message": err.to_string()})),
                )
            }
        };
    }

    (
        axum::http::StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"type": "ERROR", "message": "expected httpHostId or requestId"})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_post_rejects_unrecognized_shape() {
        let config = test_config();
        let state = SingleShotState::new(config, RouteTree::new(), Vec::new());
        let (status, _) = handle_post(State(state), Json(serde_json::json!({"nothing": true}))).await;
        assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handle_post_surfaces_connection_failure_for_request_id() {
        // No server is listening at this endpoint, so `serve_once` fails its
        // very first connection attempt instead of hanging forever.
        let config = test_config();
        let state = SingleShotState::new(config, RouteTree::new(), Vec::new());
        let (status, body) = handle_post(State(state), Json(serde_json::json!({"requestId": "r1"}))).await;
        assert_eq!(status, axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.0["type"], "ERROR");
    }

    fn test_config() -> HostConfig {
        HostConfig {
            api_key: None,
            endpoint: "wss://example.com/ws".into(),
            log_level: crate::config::LogLevel::Info,
            retry_interval: Duration::from_millis(100),
            ping_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(100),
            send_timeout: Duration::from_millis(100),
            close_unresponsive_connection_timeout: Duration::from_millis(100),
            reinitialize_batch_timeout: Duration::from_millis(100),
            complete_http_request_delay: Duration::from_millis(100),
            complete_shutdown_delay: Duration::from_millis(100),
            max_resend_attempts: 1,
            verbose_message_logs: false,
        }
    }
}
