//! Route table.
//!
//! Owns the path-matching trie and the registered routes. Build it once at
//! startup, hand it to [`App`](crate::App) or [`Server::serve`](crate::Server::serve).
//! Registration methods take and return `self` so they chain naturally;
//! a conflicting route panics there, long before the first request. The
//! `try_*` variants return the [`RouteError`] instead.
//!
//! Patterns use `:name` for a parameter and a trailing `*` for a wildcard.
//! At the same depth a static segment always beats a parameter, which beats
//! the wildcard.

mod group;
mod trie;

pub use group::Group;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::RouteError;
use crate::handler::{BoxedHandler, Handler};
use crate::method::{Method, Slot};
use crate::middleware::Middleware;
use crate::validation::{Location, Schemas, Validator};
use crate::ws::{WsCallbacks, WsHandlers};

pub(crate) use trie::RouteId;
use trie::{Segment, Trie, parse_pattern};

/// Per-route options.
///
/// ```rust
/// use std::time::Duration;
/// use tsu_core::{RouteOptions, Schema, Schemas};
///
/// let opts = RouteOptions::new()
///     .schemas(Schemas::new().params(Schema::object().field("id", Schema::string().uuid())))
///     .timeout(Duration::from_secs(2))
///     .doc(serde_json::json!({ "summary": "Fetch a user" }));
/// ```
#[derive(Clone, Debug, Default)]
pub struct RouteOptions {
    pub(crate) schemas: Schemas,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) doc: Option<Value>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schemas(mut self, schemas: Schemas) -> Self {
        self.schemas = schemas;
        self
    }

    /// Appends a route-level middleware. Runs after global and group middleware.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Free-form documentation metadata, surfaced through [`RouteInfo::doc`].
    pub fn doc(mut self, doc: Value) -> Self {
        self.doc = Some(doc);
        self
    }
}

/// What a route ends in.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Handler(BoxedHandler),
    Socket(Arc<WsCallbacks>),
}

/// A route waiting to be inserted: produced by the router and by groups.
pub(crate) struct Registration {
    pub slot: Slot,
    pub pattern: String,
    pub endpoint: Endpoint,
    pub options: RouteOptions,
}

/// A registered route. Immutable once stored.
pub(crate) struct Route {
    pub slot: Slot,
    pub pattern: String,
    pub param_names: Vec<String>,
    pub endpoint: Endpoint,
    pub options: RouteOptions,
}

/// Introspection record for documentation tooling.
#[derive(Clone, Debug, Serialize)]
pub struct RouteInfo {
    /// `"GET"`, `"POST"`, … or `"WS"` for upgrade routes.
    pub method: String,
    pub path: String,
    pub params: Vec<String>,
    /// Bound schemas, described by the configured validator.
    pub schemas: BTreeMap<Location, Value>,
    pub timeout_ms: Option<u64>,
    pub doc: Option<Value>,
}

/// The application route table.
pub struct Router {
    trie: Trie,
    routes: Vec<Route>,
    global: Vec<Middleware>,
}

impl Router {
    pub fn new() -> Self {
        Self { trie: Trie::new(), routes: Vec::new(), global: Vec::new() }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// ```rust,no_run
    /// # use tsu_core::{Context, Method, Router};
    /// # async fn get_user(_: Context) -> &'static str { "" }
    /// # async fn create_user(_: Context) -> &'static str { "" }
    /// # async fn delete_user(_: Context) -> &'static str { "" }
    /// Router::new()
    ///     .on(Method::Delete, "/users/:id", delete_user)
    ///     .on(Method::Get,    "/users/:id", get_user)
    ///     .on(Method::Post,   "/users",     create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the route conflicts with one already registered.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(method, path, handler, RouteOptions::default())
    }

    /// Like [`on`](Self::on), with schemas, middleware, a timeout or docs.
    ///
    /// # Panics
    ///
    /// Panics if the route conflicts with one already registered.
    pub fn route(mut self, method: Method, path: &str, handler: impl Handler, options: RouteOptions) -> Self {
        if let Err(e) = self.try_route(method, path, handler, options) {
            panic!("invalid route `{path}`: {e}");
        }
        self
    }

    /// Registers a route, reporting conflicts instead of panicking.
    pub fn try_route(
        &mut self,
        method: Method,
        path: &str,
        handler: impl Handler,
        options: RouteOptions,
    ) -> Result<(), RouteError> {
        self.insert(Registration {
            slot: Slot::Http(method),
            pattern: path.to_owned(),
            endpoint: Endpoint::Handler(handler.into_boxed_handler()),
            options,
        })
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Get, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Post, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Put, path, handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Patch, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Delete, path, handler)
    }

    pub fn head(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Head, path, handler)
    }

    pub fn options(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Options, path, handler)
    }

    /// Registers the same handler for every verb in [`Method::ALL`].
    pub fn all(mut self, path: &str, handler: impl Handler) -> Self {
        let handler = handler.into_boxed_handler();
        for method in Method::ALL {
            let registration = Registration {
                slot: Slot::Http(method),
                pattern: path.to_owned(),
                endpoint: Endpoint::Handler(Arc::clone(&handler)),
                options: RouteOptions::default(),
            };
            if let Err(e) = self.insert(registration) {
                panic!("invalid route `{path}`: {e}");
            }
        }
        self
    }

    /// Appends a global middleware, run on every matched request before any
    /// group or route middleware.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.global.push(middleware);
        self
    }

    /// Registers a scoped set of routes sharing `prefix` and `middleware`.
    ///
    /// ```rust,no_run
    /// # use tsu_core::{Context, Middleware, Router};
    /// # async fn list(_: Context) -> &'static str { "" }
    /// # async fn show(_: Context) -> &'static str { "" }
    /// # let auth = Middleware::terminal(|_| Box::pin(async { Ok(None) }));
    /// Router::new().group("/api/users", vec![auth], |g| {
    ///     g.get("/", list).get("/:id", show)
    /// });
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if any route in the group conflicts.
    pub fn group(mut self, prefix: &str, middleware: Vec<Middleware>, build: impl FnOnce(Group) -> Group) -> Self {
        if let Err(e) = self.try_group(prefix, middleware, build) {
            panic!("invalid route in group `{prefix}`: {e}");
        }
        self
    }

    pub fn try_group(
        &mut self,
        prefix: &str,
        middleware: Vec<Middleware>,
        build: impl FnOnce(Group) -> Group,
    ) -> Result<(), RouteError> {
        let group = build(Group::new(prefix, middleware));
        for registration in group.into_registrations() {
            self.insert(registration)?;
        }
        Ok(())
    }

    /// Registers a WebSocket upgrade route.
    ///
    /// # Panics
    ///
    /// Panics if the route conflicts with one already registered.
    pub fn ws(mut self, path: &str, handlers: WsHandlers) -> Self {
        if let Err(e) = self.try_ws(path, handlers) {
            panic!("invalid route `{path}`: {e}");
        }
        self
    }

    pub fn try_ws(&mut self, path: &str, handlers: WsHandlers) -> Result<(), RouteError> {
        let (callbacks, options) = handlers.into_parts();
        self.insert(Registration {
            slot: Slot::Upgrade,
            pattern: path.to_owned(),
            endpoint: Endpoint::Socket(callbacks),
            options,
        })
    }

    pub(crate) fn insert(&mut self, registration: Registration) -> Result<(), RouteError> {
        let Registration { slot, pattern, endpoint, options } = registration;
        let segments = parse_pattern(&pattern)?;
        let id = self.routes.len();
        self.trie.insert(slot, &pattern, &segments, id)?;

        let pattern = display_pattern(&segments);
        let param_names = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name) => Some(name.clone()),
                Segment::Wildcard => Some(trie::WILDCARD_PARAM.to_owned()),
                Segment::Static(_) => None,
            })
            .collect();

        debug!(method = %slot, path = %pattern, "route registered");
        self.routes.push(Route { slot, pattern, param_names, endpoint, options });
        Ok(())
    }

    /// Resolves `path` under `slot` to a route and its raw parameters.
    pub(crate) fn find(&self, slot: Slot, path: &str) -> Option<(RouteId, Vec<(String, String)>)> {
        self.trie.find(slot, path).map(|m| (m.route, m.params))
    }

    pub(crate) fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub(crate) fn global(&self) -> &[Middleware] {
        &self.global
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every registered route, in registration order.
    pub fn describe(&self, validator: &dyn Validator) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|route| RouteInfo {
                method: route.slot.to_string(),
                path: route.pattern.clone(),
                params: route.param_names.clone(),
                schemas: route.options.schemas.describe(validator),
                timeout_ms: route.options.timeout.map(|t| t.as_millis() as u64),
                doc: route.options.doc.clone(),
            })
            .collect()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn display_pattern(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_owned();
    }
    segments
        .iter()
        .map(|s| match s {
            Segment::Static(literal) => format!("/{literal}"),
            Segment::Param(name) => format!("/:{name}"),
            Segment::Wildcard => "/*".to_owned(),
        })
        .collect()
}

/// Joins a group prefix and a route path into one pattern.
pub(crate) fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{path}"),
        (false, true) => prefix.to_owned(),
        (false, false) => format!("{prefix}/{path}"),
    }
}
