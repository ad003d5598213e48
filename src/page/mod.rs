//! Page lifecycle and the send-coalescing engine (spec component 4.5).
//!
//! The coalescing state machine is the one piece of this runtime the spec
//! calls out as "critical, subtle" and it is reproduced here exactly:
//! `inFlight` / `debounceTimer` / `pending`, with `schedule()` collapsing
//! any updates that arrive mid-send into at most one follow-up `sendPage`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::ctx::{HandlerCtx, NotifyDelegate, Organization};
use crate::error::Result;
use crate::io_client::IoClient;
use crate::model::{Environment, RouteKind, RouteTree, User};
use crate::pending::PendingStore;
use crate::rpc::{HostMethod, RpcClient};
use crate::tagged;

/// Maximum number of `SEND_PAGE` attempts before giving up on one render.
pub const MAX_PAGE_RETRIES: u32 = 5;

/// A value that may already be known, computed lazily on a blocking thread,
/// or arrive from an async computation — the tagged union the runtime's
/// design notes describe for page title/description.
pub enum Eventual<T> {
    Immediate(T),
    Lazy(Box<dyn FnOnce() -> std::result::Result<T, String> + Send>),
    Async(Pin<Box<dyn Future<Output = std::result::Result<T, String>> + Send>>),
}

impl<T: Send + 'static> Eventual<T> {
    async fn resolve(self) -> std::result::Result<T, String> {
        match self {
            Self::Immediate(value) => Ok(value),
            Self::Lazy(f) => tokio::task::spawn_blocking(f)
                .await
                .map_err(|e| format!("panicked while resolving eventual value: {e}"))?,
            Self::Async(fut) => fut.await,
        }
    }
}

/// A page layout as returned by a [`crate::model::PageHandler`], before
/// title/description have resolved.
pub struct PageResult {
    pub title: Option<Eventual<String>>,
    pub description: Option<Eventual<String>>,
    pub children: Vec<Value>,
    pub menu_items: Vec<Value>,
}

/// An error tagged with the layout field that produced it.
#[derive(Debug, Clone)]
pub struct RenderError {
    pub layout_key: String,
    pub message: String,
}

#[derive(Default)]
struct CurrentLayout {
    title: Option<String>,
    description: Option<String>,
    children: Vec<Value>,
    menu_items: Vec<Value>,
    errors: Vec<RenderError>,
}

impl CurrentLayout {
    fn to_wire(&self) -> Value {
        serde_json::json!({
            "kind": "BASIC",
            "title": self.title,
            "description": self.description,
            "menuItems": self.menu_items,
            "children": self.children,
            "errors": self.errors.iter().map(|e| serde_json::json!({
                "layoutKey": e.layout_key,
                "message": e.message,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Default)]
struct Coalesce {
    in_flight: bool,
    debounce_scheduled: bool,
    pending: bool,
}

struct PageEntry {
    page_key: String,
    io: Arc<IoClient>,
    layout: Mutex<CurrentLayout>,
    coalesce: Mutex<Coalesce>,
    rpc: Arc<RpcClient>,
    pending_store: Arc<PendingStore>,
    retry_interval: Duration,
}

impl PageEntry {
    /// Queue a re-send, collapsing with any send already scheduled or in
    /// flight. See module docs: this is the exact state machine spec 4.5
    /// prescribes.
    async fn schedule(self: &Arc<Self>) {
        let should_start = {
            let mut state = self.coalesce.lock().await;
            state.pending = true;
            if state.in_flight || state.debounce_scheduled {
                false
            } else {
                state.debounce_scheduled = true;
                true
            }
        };
        if should_start {
            let entry = Arc::clone(self);
            tokio::spawn(async move { entry.process().await });
        }
    }

    async fn process(self: Arc<Self>) {
        {
            let mut state = self.coalesce.lock().await;
            state.debounce_scheduled = false;
            state.pending = false;
            state.in_flight = true;
        }

        self.send_page_with_retry().await;

        let should_reschedule = {
            let mut state = self.coalesce.lock().await;
            state.in_flight = false;
            state.pending
        };
        if should_reschedule {
            self.schedule().await;
        }
    }

    #[instrument(skip(self), fields(page_key = %self.page_key))]
    async fn send_page_with_retry(&self) {
        let payload = {
            let layout = self.layout.lock().await;
            layout.to_wire()
        };
        self.pending_store
            .set_layout(self.page_key.clone(), payload.clone())
            .await;

        for attempt in 1..=MAX_PAGE_RETRIES {
            let result = self
                .rpc
                .send(
                    HostMethod::SendPage,
                    serde_json::json!({
                        "pageKey": self.page_key,
                        "page": payload.to_string(),
                    }),
                    attempt,
                )
                .await;
            match result {
                Ok(_) => {
                    self.pending_store.remove_layout(&self.page_key).await;
                    return;
                }
                Err(err) => {
                    debug!(page_key = %self.page_key, attempt, error = %err, "SEND_PAGE attempt failed");
                    if attempt < MAX_PAGE_RETRIES {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        debug!(page_key = %self.page_key, "SEND_PAGE exhausted retries, giving up on this render");
    }

    async fn apply_children(&self, children: Vec<Value>, menu_items: Vec<Value>) {
        let mut layout = self.layout.lock().await;
        layout.children = children;
        layout.menu_items = menu_items;
    }

    async fn apply_title(&self, result: std::result::Result<String, String>) {
        let mut layout = self.layout.lock().await;
        match result {
            Ok(title) => layout.title = Some(title),
            Err(message) => layout.errors.push(RenderError {
                layout_key: "title".into(),
                message,
            }),
        }
    }

    async fn apply_description(&self, result: std::result::Result<String, String>) {
        let mut layout = self.layout.lock().await;
        match result {
            Ok(description) => layout.description = Some(description),
            Err(message) => layout.errors.push(RenderError {
                layout_key: "description".into(),
                message,
            }),
        }
    }
}

/// Inbound shape of an `OPEN_PAGE` call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPageInput {
    pub page_key: String,
    pub page: PageRef,
    pub user: User,
    pub environment: Environment,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub params_meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct PageRef {
    pub slug: String,
}

/// Owns every open page session for one host session.
pub struct PageManager {
    routes: Arc<RwLock<RouteTree>>,
    rpc: Arc<RpcClient>,
    pending: Arc<PendingStore>,
    pages: Mutex<HashMap<String, Arc<PageEntry>>>,
    shutting_down: Arc<AtomicBool>,
    organization: Arc<RwLock<Organization>>,
    notify_delegate: Arc<dyn NotifyDelegate>,
    retry_interval: Duration,
    max_resend_attempts: u32,
}

impl PageManager {
    #[must_use]
    #[expect(clippy::too_many_arguments, reason = "mirrors the collaborators every page session needs wired in")]
    pub fn new(
        routes: Arc<RwLock<RouteTree>>,
        rpc: Arc<RpcClient>,
        pending: Arc<PendingStore>,
        shutting_down: Arc<AtomicBool>,
        organization: Arc<RwLock<Organization>>,
        notify_delegate: Arc<dyn NotifyDelegate>,
        retry_interval: Duration,
        max_resend_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            routes,
            rpc,
            pending,
            pages: Mutex::new(HashMap::new()),
            shutting_down,
            organization,
            notify_delegate,
            retry_interval,
            max_resend_attempts,
        })
    }

    /// Number of currently open pages.
    pub async fn open_count(&self) -> usize {
        self.pages.lock().await.len()
    }

    /// Handle an inbound `OPEN_PAGE`. Returns immediately once the session
    /// is registered; rendering continues asynchronously per spec 4.5 step 6.
    #[instrument(skip(self, input), fields(page_key = %input.page_key))]
    pub async fn open_page(self: &Arc<Self>, input: OpenPageInput) -> Result<Value> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(serde_json::json!({"type": "ERROR", "message": "host is shutting down"}));
        }
        {
            let organization = self.organization.read().await;
            if organization.id.is_empty() {
                return Ok(serde_json::json!({"type": "ERROR", "message": "organization not yet known"}));
            }
        }

        let Some(route) = self.routes.read().await.get(&input.page.slug) else {
            return Ok(serde_json::json!({"type": "ERROR", "message": "unknown page slug"}));
        };
        let handler = match &route.kind {
            RouteKind::Page(h, _) => Arc::clone(h),
            RouteKind::Action(_) => {
                return Ok(serde_json::json!({"type": "ERROR", "message": "route is an action, not a page"}));
            }
        };

        let page_key = input.page_key.clone();
        let rpc_for_io = Arc::clone(&self.rpc);
        let pending_for_io = Arc::clone(&self.pending);
        let retry_interval = self.retry_interval;

        // The IOClient's `send` callback stores the latest render
        // instruction and reschedules a coalesced send, per spec 4.5 step 4.
        // `new_cyclic` lets the callback hold a weak handle back to the
        // entry it belongs to, since the entry in turn owns the client.
        let entry = Arc::new_cyclic(|weak: &std::sync::Weak<PageEntry>| {
            let weak_entry = weak.clone();
            let io = IoClient::new(move |instruction| {
                let weak_entry = weak_entry.clone();
                async move {
                    let Some(entry) = weak_entry.upgrade() else {
                        return Ok(());
                    };
                    let children = match instruction {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        other => vec![other],
                    };
                    {
                        let mut layout = entry.layout.lock().await;
                        layout.children = children;
                    }
                    entry.schedule().await;
                    Ok(())
                }
            });
            PageEntry {
                page_key: page_key.clone(),
                io: Arc::new(io),
                layout: Mutex::new(CurrentLayout::default()),
                coalesce: Mutex::new(Coalesce::default()),
                rpc: rpc_for_io,
                pending_store: pending_for_io,
                retry_interval,
            }
        });

        self.pages.lock().await.insert(page_key.clone(), Arc::clone(&entry));

        let params = tagged::decode_params(input.params, input.params_meta.as_ref());
        let organization = self.organization.read().await.clone();
        let ctx = HandlerCtx::new(
            page_key.clone(),
            input.user,
            params,
            input.environment,
            organization,
            None,
            Arc::clone(&self.rpc),
            Arc::clone(&self.pending),
            Arc::clone(&self.notify_delegate),
            self.max_resend_attempts,
            self.retry_interval,
        );

        let io_for_handler = Arc::clone(&entry.io);
        let manager_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            match handler.call(io_for_handler, ctx).await {
                Ok(layout) => manager_entry.render(layout).await,
                Err(err) => {
                    warn!(page_key = %manager_entry.page_key, error = %err, "page handler failed");
                    manager_entry
                        .apply_title(Err(format!("page handler failed: {err}")))
                        .await;
                    manager_entry.schedule().await;
                }
            }
        });

        Ok(serde_json::json!({"type": "SUCCESS", "pageKey": page_key}))
    }

    /// Handle an inbound `CLOSE_PAGE`.
    #[instrument(skip(self))]
    pub async fn close_page(&self, page_key: &str) {
        let Some(entry) = self.pages.lock().await.remove(page_key) else {
            return;
        };
        entry.io.close().await;
        self.pending.remove_layout(page_key).await;
        self.pending.remove_loading(page_key).await;
    }
}

impl PageEntry {
    async fn render(self: &Arc<Self>, result: PageResult) {
        self.apply_children(result.children, result.menu_items).await;

        if let Some(title) = result.title {
            let entry = Arc::clone(self);
            tokio::spawn(async move {
                let resolved = title.resolve().await;
                entry.apply_title(resolved).await;
                entry.schedule().await;
            });
        }
        if let Some(description) = result.description {
            let entry = Arc::clone(self);
            tokio::spawn(async move {
                let resolved = description.resolve().await;
                entry.apply_description(resolved).await;
                entry.schedule().await;
            });
        }
        self.schedule().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry() -> Arc<PageEntry> {
        let schemas = crate::rpc::schema::default_registry().expect("registry");
        let rpc = RpcClient::new(schemas, Duration::from_millis(50));
        Arc::new(PageEntry {
            page_key: "p1".into(),
            io: Arc::new(IoClient::new(|_v| async { Ok(()) })),
            layout: Mutex::new(CurrentLayout::default()),
            coalesce: Mutex::new(Coalesce::default()),
            rpc,
            pending_store: Arc::new(PendingStore::new()),
            retry_interval: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn schedule_collapses_concurrent_updates() {
        let entry = test_entry();
        // Three updates in rapid succession should still coalesce into the
        // state machine's `pending` flag rather than queuing three sends.
        entry.schedule().await;
        entry.schedule().await;
        entry.schedule().await;
        // Allow the spawned processing task to run; with no transport bound
        // the send fails immediately and retries exhaust quickly given the
        // 1ms retry interval configured above.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = entry.coalesce.lock().await;
        assert!(!state.pending);
    }

    #[tokio::test]
    async fn eventual_immediate_resolves_to_value() {
        let eventual = Eventual::Immediate("hello".to_owned());
        assert_eq!(eventual.resolve().await, Ok("hello".to_owned()));
    }

    #[tokio::test]
    async fn eventual_async_propagates_error() {
        let eventual: Eventual<String> = Eventual::Async(Box::pin(async { Err("boom".to_owned()) }));
        assert_eq!(eventual.resolve().await, Err("boom".to_owned()));
    }
}
