//! Per-request context.
//!
//! One [`Context`] is built for every inbound request and moved through the
//! middleware chain into the handler. It carries:
//!
//! - the request head (method, URI, headers, extensions),
//! - path params, query and body as `serde_json::Value`s, which the
//!   validation stage may replace with coerced values,
//! - a free-form [`State`] bag for middleware to hand data downstream,
//! - response headers and cookies set *before* a response exists,
//! - the cancellation token raised by the timeout guard.
//!
//! Pending headers and cookies sit in a cell the orchestrator also holds, so
//! they reach the final response no matter who built it, even after the
//! context itself has been dropped by a handler.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, CONTENT_DISPOSITION, HeaderMap, HeaderName, HeaderValue, LOCATION, SET_COOKIE};
use http::{Extensions, StatusCode, Uri};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cookie::{self, CookieOptions};
use crate::error::{BoxError, HttpError};
use crate::method::Method;
use crate::response::{ContentType, Response};
use crate::validation::{Location, ValidationErrors};

pub(crate) type RawBody = UnsyncBoxBody<Bytes, BoxError>;

/// Peer address of the connection, inserted into request extensions by the server.
#[derive(Clone, Copy, Debug)]
pub struct ClientAddr(pub SocketAddr);

// ── Pending response metadata ─────────────────────────────────────────────────

/// Headers and cookies accumulated before a response object exists.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    headers: HeaderMap,
    cookies: Vec<HeaderValue>,
}

pub(crate) type PendingCell = Arc<Mutex<Pending>>;

impl Pending {
    /// Copies pending metadata onto `response`.
    ///
    /// With `overwrite`, pending headers replace same-named ones already on the
    /// response; without it, headers the response already carries are kept.
    /// A cookie identical to a `Set-Cookie` value already present is never
    /// appended twice.
    pub(crate) fn apply(&self, response: &mut Response, overwrite: bool) {
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if overwrite || !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        for cookie in &self.cookies {
            if !headers.get_all(SET_COOKIE).iter().any(|existing| existing == cookie) {
                headers.append(SET_COOKIE, cookie.clone());
            }
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

/// String-keyed bag of arbitrary values shared between pipeline stages.
///
/// ```rust
/// # use tsu_core::State;
/// #[derive(Debug, PartialEq)]
/// struct User { id: u64 }
///
/// let mut state = State::default();
/// state.insert("user", User { id: 7 });
/// assert_eq!(state.get::<User>("user"), Some(&User { id: 7 }));
/// assert_eq!(state.get::<String>("user"), None);
/// ```
#[derive(Default)]
pub struct State {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl State {
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut()
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let boxed = self.values.remove(key)?;
        boxed.downcast().ok().map(|b| *b)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// The per-request context handed to middleware and handlers.
pub struct Context {
    head: http::request::Parts,
    raw_body: Mutex<Option<RawBody>>,
    body_parsed: bool,
    body_bytes: Bytes,
    params: Value,
    query: Value,
    body: Value,
    state: State,
    pending: PendingCell,
    signal: CancellationToken,
}

impl Context {
    /// Builds a context from any `http::Request`. Path params start empty.
    ///
    /// The server calls this for every request; it is public so middleware can
    /// be exercised without a socket.
    pub fn from_request<B>(req: http::Request<B>) -> Self
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (head, body) = req.into_parts();
        let query = head.uri.query().map(parse_query).unwrap_or_else(empty_object);

        Self {
            head,
            raw_body: Mutex::new(Some(body.map_err(Into::<BoxError>::into).boxed_unsync())),
            body_parsed: false,
            body_bytes: Bytes::new(),
            params: empty_object(),
            query,
            body: Value::Null,
            state: State::default(),
            pending: PendingCell::default(),
            signal: CancellationToken::new(),
        }
    }

    pub(crate) fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        let map: Map<String, Value> = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        self.params = Value::Object(map);
        self
    }

    pub(crate) fn pending_cell(&self) -> PendingCell {
        Arc::clone(&self.pending)
    }

    // ── Request head ─────────────────────────────────────────────────────────

    pub fn method(&self) -> &http::Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn extensions(&self) -> &Extensions {
        &self.head.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.head.extensions
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.head.extensions.get::<ClientAddr>().map(|c| c.0)
    }

    // ── Inputs ───────────────────────────────────────────────────────────────

    /// Returns a named path parameter as a string.
    ///
    /// For a route `/users/:id`, `ctx.param("id")` on `/users/42` returns `Some("42")`.
    /// Returns `None` once validation has coerced the value to a non-string.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)?.as_str()
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn query(&self) -> &Value {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name)?.as_str()
    }

    /// The parsed body, `Null` until [`parse_body`](Self::parse_body) has run
    /// or when the body could not be decoded.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Raw body bytes, empty until [`parse_body`](Self::parse_body) has run.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body_bytes
    }

    /// Reads and decodes the request body, at most once.
    ///
    /// Skipped for `GET`/`HEAD`. `application/json` and
    /// `application/x-www-form-urlencoded` are decoded; anything else leaves
    /// [`body`](Self::body) as `Null` with the bytes kept in
    /// [`body_bytes`](Self::body_bytes). Read and decode failures are absorbed:
    /// the body stays `Null` and a schema requiring fields rejects it later.
    pub async fn parse_body(&mut self) -> &Value {
        if self.body_parsed {
            return &self.body;
        }
        self.body_parsed = true;

        let carries_body = Method::try_from(&self.head.method).is_ok_and(Method::allows_body);
        if !carries_body {
            return &self.body;
        }
        let Some(raw) = self.raw_body.get_mut().take() else {
            return &self.body;
        };

        match raw.collect().await {
            Ok(collected) => self.body_bytes = collected.to_bytes(),
            Err(e) => {
                debug!("request body read failed: {e}");
                return &self.body;
            }
        }

        let content_type = self.header(header::CONTENT_TYPE.as_str()).unwrap_or_default().to_ascii_lowercase();
        if content_type.starts_with("application/json") || content_type.contains("+json") {
            match serde_json::from_slice(&self.body_bytes) {
                Ok(value) => self.body = value,
                Err(e) => debug!("json body decode failed: {e}"),
            }
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&self.body_bytes) {
                Ok(pairs) => self.body = pairs_to_object(pairs),
                Err(e) => debug!("form body decode failed: {e}"),
            }
        }

        &self.body
    }

    pub(crate) fn set_input(&mut self, location: Location, value: Value) {
        match location {
            Location::Query  => self.query = value,
            Location::Params => self.params = value,
            Location::Body   => self.body = value,
        }
    }

    pub(crate) fn input(&self, location: Location) -> &Value {
        match location {
            Location::Query  => &self.query,
            Location::Params => &self.params,
            Location::Body   => &self.body,
        }
    }

    /// Deserializes the path params into `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        deserialize(Location::Params, &self.params)
    }

    /// Deserializes the query into `T`.
    pub fn query_as<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        deserialize(Location::Query, &self.query)
    }

    /// Parses the body if needed and deserializes it into `T`.
    pub async fn body_as<T: DeserializeOwned>(&mut self) -> Result<T, HttpError> {
        let body = self.parse_body().await;
        deserialize(Location::Body, body)
    }

    // ── State and cancellation ───────────────────────────────────────────────

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Fires when the route's timeout expires. Long-running handlers should
    /// watch it and abandon downstream work.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    // ── Pending response metadata ────────────────────────────────────────────

    /// Sets a header on whatever response this request ends up producing.
    /// Invalid names or values are skipped with a warning.
    pub fn set_header<K, V>(&mut self, name: K, value: V)
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
    {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.pending.lock().headers.insert(name, value);
            }
            _ => warn!("skipping invalid pending header"),
        }
    }

    /// Queues a `Set-Cookie` for the eventual response.
    pub fn set_cookie(&mut self, name: &str, value: &str, opts: &CookieOptions) {
        match HeaderValue::try_from(cookie::serialize(name, value, opts)) {
            Ok(v) => self.pending.lock().cookies.push(v),
            Err(_) => warn!(cookie = name, "skipping cookie with invalid characters"),
        }
    }

    /// Expires a cookie on the client.
    pub fn clear_cookie(&mut self, name: &str, opts: &CookieOptions) {
        let opts = opts.clone().max_age(std::time::Duration::ZERO);
        self.set_cookie(name, "", &opts);
    }

    /// Reads one cookie from the `Cookie` request header.
    pub fn get_cookie(&self, name: &str) -> Option<String> {
        self.cookies().remove(name)
    }

    /// Parses the `Cookie` request header. Every call re-reads the header.
    pub fn cookies(&self) -> HashMap<String, String> {
        self.head
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|raw| cookie::parse(raw))
            .collect()
    }

    // ── Response helpers ─────────────────────────────────────────────────────

    /// `200 OK` JSON response carrying everything set so far.
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Response {
        self.finish(Response::json(value))
    }

    pub fn json_with_status<T: Serialize + ?Sized>(&self, status: StatusCode, value: &T) -> Response {
        self.finish(Response::builder().status(status).json(value))
    }

    pub fn text(&self, body: impl Into<String>) -> Response {
        self.finish(Response::text(body))
    }

    pub fn status_only(&self, status: StatusCode) -> Response {
        self.finish(Response::empty(status))
    }

    /// Binary response with `content-disposition: attachment`.
    pub fn download(&self, body: impl Into<Bytes>, filename: &str) -> Response {
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        self.finish(
            Response::builder()
                .header(CONTENT_DISPOSITION, disposition)
                .bytes(ContentType::OctetStream, body),
        )
    }

    pub fn redirect(&self, location: &str, status: StatusCode) -> Response {
        self.finish(Response::builder().status(status).header(LOCATION, location).no_body())
    }

    fn finish(&self, mut response: Response) -> Response {
        self.pending.lock().apply(&mut response, true);
        response
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("params", &self.params)
            .field("query", &self.query)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Repeated keys: the last value wins.
fn pairs_to_object(pairs: Vec<(String, String)>) -> Value {
    Value::Object(pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

fn parse_query(raw: &str) -> Value {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(raw) {
        Ok(pairs) => pairs_to_object(pairs),
        Err(e) => {
            debug!("query decode failed: {e}");
            empty_object()
        }
    }
}

fn deserialize<T: DeserializeOwned>(location: Location, value: &Value) -> Result<T, HttpError> {
    T::deserialize(value).map_err(|e| {
        let mut errors = ValidationErrors::default();
        errors.add(location, "$", e.to_string());
        HttpError::Validation(errors)
    })
}
