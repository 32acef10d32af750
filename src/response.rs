//! Outgoing HTTP response type and handler-result normalization.
//!
//! A handler may return a ready [`Response`], but it does not have to. Anything
//! implementing [`IntoReply`] is accepted and normalized once the handler
//! resolves:
//!
//! | handler returns | becomes |
//! |---|---|
//! | [`Response`] | itself |
//! | JSON object or array ([`Json`], `serde_json::Value`) | `200 application/json` |
//! | `String` / `&'static str` / JSON string | `200 text/plain` |
//! | `Err(e)` | the error stage |
//! | anything else (`()`, JSON numbers, `null`) | `500`, logged |

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::Full;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::HttpError;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ResponseBuilder::bytes`].
#[derive(Clone, Copy, Debug)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Pdf,          // application/pdf
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Pdf         => "application/pdf",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// ```rust
/// use http::StatusCode;
/// use serde_json::json;
/// use tsu_core::Response;
///
/// Response::json(&json!({ "id": 1 }));
/// Response::text("hello");
/// Response::empty(StatusCode::NO_CONTENT);
///
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .json(&json!({ "id": 42 }));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// `200 OK` with `application/json`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        Self::builder().json(value)
    }

    /// `200 OK` with `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// Response with no body.
    pub fn empty(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: Bytes::new() }
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { status: StatusCode::OK, headers: HeaderMap::new() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Case-insensitive lookup of the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Drops the body while keeping headers, for `HEAD` requests.
    pub(crate) fn strip_body(&mut self) {
        self.body = Bytes::new();
    }

    /// Converts into the hyper-facing representation.
    pub fn into_inner(self) -> http::Response<Full<Bytes>> {
        let mut res = http::Response::new(Full::new(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200 OK`.
/// Terminated by a typed body method.
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseBuilder {
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Appends a header. Invalid names or values are skipped with a warning.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
    {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!("skipping invalid response header"),
        }
        self
    }

    /// Terminate with a serialized JSON body (`application/json`).
    ///
    /// A value that fails to serialize yields an empty `500` and an error event.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Response {
        match serde_json::to_vec(value) {
            Ok(body) => self.finish(ContentType::Json, body.into()),
            Err(e) => {
                error!("response serialization failed: {e}");
                Response::empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        let body: String = body.into();
        self.finish(ContentType::Text, Bytes::from(body))
    }

    /// Terminate with a typed body. Use this for XML, HTML, binary, SSE, etc.
    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Response {
        self.finish(content_type, body.into())
    }

    /// Terminate with no body (e.g. `204 No Content`, redirects).
    pub fn no_body(self) -> Response {
        Response { status: self.status, headers: self.headers, body: Bytes::new() }
    }

    fn finish(mut self, content_type: ContentType, body: Bytes) -> Response {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        Response { status: self.status, headers: self.headers, body }
    }
}

// ── Reply / IntoReply ─────────────────────────────────────────────────────────

/// What a handler produced, before normalization.
#[derive(Debug)]
pub enum Reply {
    Response(Response),
    Json(Value),
    Text(String),
    Error(HttpError),
    /// The handler produced nothing usable.
    Empty,
}

/// Conversion of handler results into a [`Reply`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply { self }
}

impl IntoReply for Response {
    fn into_reply(self) -> Reply { Reply::Response(self) }
}

impl IntoReply for Value {
    fn into_reply(self) -> Reply { Reply::Json(self) }
}

impl IntoReply for String {
    fn into_reply(self) -> Reply { Reply::Text(self) }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Reply { Reply::Text(self.to_owned()) }
}

/// Return a status directly from a handler: `return StatusCode::NO_CONTENT`
impl IntoReply for StatusCode {
    fn into_reply(self) -> Reply { Reply::Response(Response::empty(self)) }
}

impl IntoReply for () {
    fn into_reply(self) -> Reply { Reply::Empty }
}

impl IntoReply for HttpError {
    fn into_reply(self) -> Reply { Reply::Error(self) }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<HttpError>,
{
    fn into_reply(self) -> Reply {
        match self {
            Ok(value) => value.into_reply(),
            Err(e) => Reply::Error(e.into()),
        }
    }
}

/// Serializes any `T: Serialize` as a handler result.
///
/// ```rust
/// use serde::Serialize;
/// use tsu_core::{Context, Json};
///
/// #[derive(Serialize)]
/// struct User { id: u64 }
///
/// async fn get_user(_ctx: Context) -> Json<User> {
///     Json(User { id: 1 })
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Reply {
        match serde_json::to_value(&self.0) {
            Ok(value) => Reply::Json(value),
            Err(e) => Reply::Error(HttpError::internal(e)),
        }
    }
}

/// Turns a resolved handler result into a canonical [`Response`].
pub(crate) fn normalize(reply: Reply) -> Result<Response, HttpError> {
    match reply {
        Reply::Response(response) => Ok(response),
        Reply::Json(value @ (Value::Object(_) | Value::Array(_))) => Ok(Response::json(&value)),
        Reply::Json(Value::String(text)) | Reply::Text(text) => Ok(Response::text(text)),
        Reply::Json(other) => Err(HttpError::internal(format!(
            "handler returned a bare JSON value `{other}`; wrap it in an object or array",
        ))),
        Reply::Error(e) => Err(e),
        Reply::Empty => Err(HttpError::internal("handler returned no response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_and_arrays_become_json() {
        let resp = normalize(json!({ "ok": true }).into_reply()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.body().as_ref(), br#"{"ok":true}"#);

        let resp = normalize(Json(vec![1, 2, 3]).into_reply()).unwrap();
        assert_eq!(resp.body().as_ref(), b"[1,2,3]");
    }

    #[test]
    fn strings_become_text() {
        let resp = normalize("hello".into_reply()).unwrap();
        assert_eq!(resp.header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(resp.body().as_ref(), b"hello");

        let resp = normalize(json!("also text").into_reply()).unwrap();
        assert_eq!(resp.body().as_ref(), b"also text");
    }

    #[test]
    fn anything_else_is_an_internal_error() {
        for reply in [json!(42).into_reply(), json!(null).into_reply(), ().into_reply()] {
            let err = normalize(reply).unwrap_err();
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn errors_pass_through_untouched() {
        let result: Result<Response, HttpError> = Err(HttpError::forbidden("nope"));
        let err = normalize(result.into_reply()).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn builder_sets_status_and_headers() {
        let resp = Response::builder()
            .status(StatusCode::CREATED)
            .header("location", "/users/42")
            .header("bad header", "x")
            .bytes(ContentType::Xml, "<ok/>");
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.header("location"), Some("/users/42"));
        assert_eq!(resp.header("content-type"), Some("application/xml"));
        assert_eq!(resp.headers().len(), 2);
    }

    #[test]
    fn into_inner_keeps_everything() {
        let inner = Response::builder().status(StatusCode::ACCEPTED).text("queued").into_inner();
        assert_eq!(inner.status(), StatusCode::ACCEPTED);
        assert_eq!(inner.headers()["content-type"], "text/plain; charset=utf-8");
    }
}
