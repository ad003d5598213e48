//! Route definitions and the data shared with the orchestrator on declare.
//!
//! The core treats handlers as opaque callbacks; everything here describes
//! *shape* (slugs, access, flags) rather than UI content, which stays out of
//! scope per the runtime's non-goals.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ctx::HandlerCtx;
use crate::error::Result;
use crate::io_client::IoClient;

/// Deployment environment reported by the orchestrator on every invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

/// The end user an invocation is acting on behalf of. Authentication itself
/// is the orchestrator's responsibility; the host only ever sees the result.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

/// Who may invoke a route. Left as an opaque token; the orchestrator is the
/// arbiter of access, the host only forwards the declared policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub teams: Vec<String>,
}

/// Non-default behavior flags carried on a route.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RouteFlags {
    pub unlisted: bool,
    pub backgroundable: bool,
    pub warn_on_close: bool,
}

/// Slug validation pattern: `[A-Za-z0-9_.-]+`.
#[must_use]
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// A named, described collection of actions, declared alongside them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionGroup {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

/// Output of an action handler invocation, after tagged-meta encoding.
pub type ActionOutput = serde_json::Value;

/// A handler invoked for a `START_TRANSACTION`.
///
/// Boxed as a trait object so the host can hold a heterogeneous registry of
/// handlers behind a single map; `io` is the external I/O builder
/// collaborator, opaque beyond the [`IoClient`] seam it drives.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, io: Arc<IoClient>, ctx: HandlerCtx) -> Result<ActionOutput>;
}

#[async_trait::async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(Arc<IoClient>, HandlerCtx) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ActionOutput>> + Send,
{
    async fn call(&self, io: Arc<IoClient>, ctx: HandlerCtx) -> Result<ActionOutput> {
        self(io, ctx).await
    }
}

/// A handler invoked for an `OPEN_PAGE`. Title and description may resolve
/// lazily or asynchronously; see [`crate::page::Eventual`].
#[async_trait::async_trait]
pub trait PageHandler: Send + Sync {
    async fn call(&self, io: Arc<IoClient>, ctx: HandlerCtx) -> Result<crate::page::PageResult>;
}

#[async_trait::async_trait]
impl<F, Fut> PageHandler for F
where
    F: Fn(Arc<IoClient>, HandlerCtx) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<crate::page::PageResult>> + Send,
{
    async fn call(&self, io: Arc<IoClient>, ctx: HandlerCtx) -> Result<crate::page::PageResult> {
        self(io, ctx).await
    }
}

/// What kind of route a given slug resolves to.
pub enum RouteKind {
    Action(Arc<dyn ActionHandler>),
    Page(Arc<dyn PageHandler>, RouteTree),
}

/// One entry in the route tree: a slug plus its handler and metadata.
pub struct Route {
    pub slug: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub access: AccessPolicy,
    pub flags: RouteFlags,
    pub group: Option<String>,
    pub kind: RouteKind,
}

/// A set of routes, keyed by their slug within this scope.
///
/// Fully-qualified slugs (dotted path from the tree root) are validated for
/// global uniqueness when the tree is declared, not at insertion time —
/// mirrors the upstream behavior of reporting `invalidSlugs` in bulk.
#[derive(Clone, Default)]
pub struct RouteTree {
    routes: BTreeMap<String, Arc<Route>>,
}

impl RouteTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route. Last write for a given slug wins, matching a
    /// re-declared route table overwriting the prior definition.
    pub fn insert(&mut self, route: Route) {
        self.routes.insert(route.slug.clone(), Arc::new(route));
    }

    #[must_use]
    pub fn get(&self, slug: &str) -> Option<Arc<Route>> {
        self.routes.get(slug).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

/// External collaborator: loads additional routes (e.g. from a filesystem
/// module tree) and reports change events. The default source never
/// contributes routes and never signals a change; a real loader is supplied
/// by the caller.
#[async_trait::async_trait]
pub trait RouteSource: Send + Sync {
    /// Re-walk whatever backs this source and return the routes found.
    async fn load(&self) -> Result<Vec<Route>>;
}

/// The no-op default [`RouteSource`].
pub struct EmptyRouteSource;

#[async_trait::async_trait]
impl RouteSource for EmptyRouteSource {
    async fn load(&self) -> Result<Vec<Route>> {
        Ok(Vec::new())
    }
}

/// A [`RouteSource`] for callers building their route table programmatically
/// rather than from a filesystem loader: hands back the routes it was built
/// with exactly once, then reports no further changes.
pub struct RouteTreeBuilder {
    routes: Mutex<Option<Vec<Route>>>,
}

impl RouteTreeBuilder {
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: Mutex::new(Some(routes)),
        }
    }
}

#[async_trait::async_trait]
impl RouteSource for RouteTreeBuilder {
    async fn load(&self) -> Result<Vec<Route>> {
        Ok(self.routes.lock().await.take().unwrap_or_default())
    }
}

/// Action metadata sent to the orchestrator (no handler payload).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub group_slug: Option<String>,
    pub slug: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub unlisted: bool,
    pub access: AccessPolicy,
}

/// Page metadata sent to the orchestrator (no handler payload).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageDefinition {
    pub slug: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub has_handler: bool,
    pub unlisted: bool,
    pub access: AccessPolicy,
}

/// Walk a [`RouteTree`] and derive the flat declarations sent on
/// `INITIALIZE_HOST`.
#[must_use]
pub fn derive_definitions(tree: &RouteTree) -> (Vec<ActionDefinition>, Vec<PageDefinition>) {
    let mut actions = Vec::new();
    let mut pages = Vec::new();
    for route in tree.iter() {
        match &route.kind {
            RouteKind::Action(_) => actions.push(ActionDefinition {
                group_slug: route.group.clone(),
                slug: route.slug.clone(),
                name: route.name.clone(),
                description: route.description.clone(),
                unlisted: route.flags.unlisted,
                access: route.access.clone(),
            }),
            RouteKind::Page(_, children) => {
                pages.push(PageDefinition {
                    slug: route.slug.clone(),
                    name: route.name.clone(),
                    description: route.description.clone(),
                    has_handler: true,
                    unlisted: route.flags.unlisted,
                    access: route.access.clone(),
                });
                let (child_actions, child_pages) = derive_definitions(children);
                actions.extend(child_actions);
                pages.extend(child_pages);
            }
        }
    }
    (actions, pages)
}
