//! Prefix-scoped route builder used by `Router::group`.

use std::sync::Arc;

use crate::handler::Handler;
use crate::method::{Method, Slot};
use crate::middleware::Middleware;
use crate::ws::WsHandlers;

use super::{Endpoint, Registration, RouteOptions, join_path};

/// Routes sharing a path prefix and a middleware list.
///
/// Built inside [`Router::group`](super::Router::group). Group middleware
/// runs after global middleware and before route middleware; nested groups
/// concatenate both prefix and middleware, outermost first.
pub struct Group {
    prefix: String,
    middleware: Vec<Middleware>,
    registrations: Vec<Registration>,
}

impl Group {
    pub(crate) fn new(prefix: &str, middleware: Vec<Middleware>) -> Self {
        Self { prefix: join_path(prefix, ""), middleware, registrations: Vec::new() }
    }

    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(method, path, handler, RouteOptions::default())
    }

    pub fn route(mut self, method: Method, path: &str, handler: impl Handler, options: RouteOptions) -> Self {
        let endpoint = Endpoint::Handler(handler.into_boxed_handler());
        self.push(Slot::Http(method), path, endpoint, options);
        self
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

    pub fn all(mut self, path: &str, handler: impl Handler) -> Self {
        let handler = handler.into_boxed_handler();
        for method in Method::ALL {
            let endpoint = Endpoint::Handler(Arc::clone(&handler));
            self.push(Slot::Http(method), path, endpoint, RouteOptions::default());
        }
        self
    }

    pub fn ws(mut self, path: &str, handlers: WsHandlers) -> Self {
        let (callbacks, options) = handlers.into_parts();
        self.push(Slot::Upgrade, path, Endpoint::Socket(callbacks), options);
        self
    }

    /// A nested group under this one.
    pub fn group(mut self, prefix: &str, middleware: Vec<Middleware>, build: impl FnOnce(Group) -> Group) -> Self {
        let mut scoped = self.middleware.clone();
        scoped.extend(middleware);
        let nested = build(Group::new(&join_path(&self.prefix, prefix), scoped));
        // The nested group already carries our middleware and prefix.
        self.registrations.extend(nested.registrations);
        self
    }

    fn push(&mut self, slot: Slot, path: &str, endpoint: Endpoint, mut options: RouteOptions) {
        let mut middleware = self.middleware.clone();
        middleware.append(&mut options.middleware);
        options.middleware = middleware;
        self.registrations.push(Registration {
            slot,
            pattern: join_path(&self.prefix, path),
            endpoint,
            options,
        });
    }

    pub(crate) fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    async fn noop(_ctx: Context) -> &'static str {
        "ok"
    }

    fn pass() -> Middleware {
        Middleware::terminal(|_ctx| Box::pin(async { Ok(None) }))
    }

    #[test]
    fn nested_groups_concatenate_prefix_and_middleware() {
        let outer = Group::new("/api", vec![pass()]).group("/v1", vec![pass(), pass()], |g| {
            g.route(Method::Get, "/users", noop, RouteOptions::new().middleware(pass()))
        });

        let registrations = outer.into_registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].pattern, "/api/v1/users");
        assert_eq!(registrations[0].options.middleware.len(), 4);
    }

    #[test]
    fn root_path_in_a_group_is_the_prefix() {
        let registrations = Group::new("/health/", vec![]).get("/", noop).into_registrations();
        assert_eq!(registrations[0].pattern, "/health");
    }
}
