//! Request orchestration.
//!
//! [`App`] freezes a [`Router`] and a [`Config`] into one compiled chain per
//! route, then handles requests:
//!
//! 1. Resolve the route. A `GET` asking for a WebSocket upgrade is looked up
//!    under [`Slot::Upgrade`] first; `HEAD` falls back to `GET`.
//! 2. Build the [`Context`] and run the chain (global, group and route
//!    middleware, validation, then the handler under its timeout guard or
//!    the upgrade bridge).
//! 3. Catch whatever escaped: an [`HttpError`], or a panic, which becomes
//!    an internal error. Hand it to the error stage.
//! 4. Merge pending headers and cookies into the final response, whoever
//!    built it, and report the request to the logger.

use std::any::Any;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::FutureExt;
use http::StatusCode;
use http::HeaderValue;
use http::header::{CONTENT_LENGTH, UPGRADE};
use tracing::error;

use crate::config::Config;
use crate::context::{ClientAddr, Context};
use crate::error::{BoxError, HttpError};
use crate::logger::RequestLog;
use crate::method::{Method, Slot};
use crate::middleware::{ChainFn, Middleware, dispatch};
use crate::response::Response;
use crate::router::{Endpoint, Route, RouteId, RouteInfo, Router};
use crate::{timeout, validation, ws};

/// What the error handler learns about the failed request.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub method: http::Method,
    pub path: String,
    pub client_ip: Option<IpAddr>,
}

/// A router compiled against a configuration. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
}

struct Inner {
    router: Router,
    chains: Vec<Arc<[ChainFn]>>,
    config: Config,
}

impl App {
    pub fn new(router: Router, config: Config) -> Self {
        let chains = router
            .routes()
            .iter()
            .map(|route| compile(router.global(), route, &config))
            .collect();
        Self { inner: Arc::new(Inner { router, chains, config }) }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Every registered route with its schemas described by the configured
    /// validator.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.inner.router.describe(self.inner.config.validator.as_ref())
    }

    /// Runs one request through the pipeline. Never fails: every error is
    /// rendered by the error stage.
    pub async fn handle<B>(&self, req: http::Request<B>) -> Response
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let info = RequestInfo {
            method: req.method().clone(),
            path: req.uri().path().to_owned(),
            client_ip: req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip()),
        };
        let upgrade = is_websocket_upgrade(&req);

        let ctx = Context::from_request(req);
        let pending = ctx.pending_cell();

        let outcome = match self.resolve(&info.method, &info.path, upgrade) {
            Some((route, params)) => {
                let chain = Arc::clone(&self.inner.chains[route]);
                AssertUnwindSafe(dispatch(chain, ctx.with_params(params)))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(HttpError::internal(panic_message(panic))))
            }
            None => Err(HttpError::not_found("Not Found")),
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => self.render_error(&err, &info),
        };
        pending.lock().apply(&mut response, false);

        if info.method == http::Method::HEAD {
            if !response.headers().contains_key(CONTENT_LENGTH) {
                let len = HeaderValue::from(response.body().len());
                response.headers_mut().insert(CONTENT_LENGTH, len);
            }
            response.strip_body();
        }

        let logger = &self.inner.config.logger;
        if logger.is_enabled() && response.status() != StatusCode::SWITCHING_PROTOCOLS {
            logger.log(&RequestLog {
                method: info.method,
                path: info.path,
                status: response.status(),
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                client_ip: info.client_ip,
            });
        }

        response
    }

    fn resolve(&self, method: &http::Method, path: &str, upgrade: bool) -> Option<(RouteId, Vec<(String, String)>)> {
        let router = &self.inner.router;
        if upgrade {
            if let Some(hit) = router.find(Slot::Upgrade, path) {
                return Some(hit);
            }
        }
        let method = Method::try_from(method).ok()?;
        router.find(Slot::Http(method), path).or_else(|| match method {
            Method::Head => router.find(Slot::Http(Method::Get), path),
            _ => None,
        })
    }

    fn render_error(&self, err: &HttpError, info: &RequestInfo) -> Response {
        if let HttpError::Internal(source) = err {
            error!(method = %info.method, path = %info.path, error = %source_chain(source.as_ref()), "request failed");
        }
        match &self.inner.config.error_handler {
            Some(handler) => handler(err, Some(info)),
            None => err.to_response(),
        }
    }
}

impl From<Router> for App {
    fn from(router: Router) -> Self {
        Self::new(router, Config::default())
    }
}

/// global → group → route middleware, validation, endpoint.
fn compile(global: &[Middleware], route: &Route, config: &Config) -> Arc<[ChainFn]> {
    let mut chain: Vec<ChainFn> = global
        .iter()
        .chain(&route.options.middleware)
        .cloned()
        .map(Middleware::into_stage)
        .collect();

    if !route.options.schemas.is_empty() {
        chain.push(validation::stage(route.options.schemas.clone(), Arc::clone(&config.validator)));
    }

    chain.push(match &route.endpoint {
        Endpoint::Handler(handler) => timeout::endpoint(Arc::clone(handler), route.options.timeout),
        Endpoint::Socket(callbacks) => ws::endpoint(Arc::clone(callbacks), config.ws.clone()),
    });
    chain.into()
}

fn is_websocket_upgrade<B>(req: &http::Request<B>) -> bool {
    req.method() == http::Method::GET
        && req
            .headers()
            .get_all(UPGRADE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("websocket")))
}

/// `outer: cause: root cause`.
fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut next = err.source();
    while let Some(cause) = next {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        next = cause.source();
    }
    out
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_owned());
    format!("handler panicked: {detail}")
}
