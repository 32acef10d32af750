//! Application configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use tsu_core::{Config, RequestLogger, WsConfig};
//!
//! let config = Config::new()
//!     .logger(RequestLogger::Tracing)
//!     .idle_timeout(Duration::from_secs(30))
//!     .ws(WsConfig::default().max_payload_length(64 * 1024));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::app::RequestInfo;
use crate::error::HttpError;
use crate::logger::RequestLogger;
use crate::response::Response;
use crate::validation::{SchemaValidator, Validator};

/// Renders every error that escapes the pipeline.
pub type ErrorHandler = Arc<dyn Fn(&HttpError, Option<&RequestInfo>) -> Response + Send + Sync>;

/// Top-level configuration, consumed by [`App::new`](crate::App::new).
#[derive(Clone)]
pub struct Config {
    pub(crate) logger: RequestLogger,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) ws: WsConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a [`RequestLogger`] or a plain `bool`.
    pub fn logger(mut self, logger: impl Into<RequestLogger>) -> Self {
        self.logger = logger.into();
        self
    }

    /// Replaces the default JSON error rendering.
    ///
    /// ```rust
    /// use tsu_core::{Config, Response};
    ///
    /// let config = Config::new().error_handler(|err, _req| {
    ///     Response::builder().status(err.status()).text(err.message())
    /// });
    /// ```
    pub fn error_handler(
        mut self,
        handler: impl Fn(&HttpError, Option<&RequestInfo>) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// How long an HTTP/1 connection may sit without sending request headers.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn ws(mut self, ws: WsConfig) -> Self {
        self.ws = ws;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logger: RequestLogger::Off,
            error_handler: None,
            validator: Arc::new(SchemaValidator),
            idle_timeout: None,
            ws: WsConfig::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("logger", &self.logger)
            .field("error_handler", &self.error_handler.as_ref().map(|_| ".."))
            .field("idle_timeout", &self.idle_timeout)
            .field("ws", &self.ws)
            .finish_non_exhaustive()
    }
}

/// WebSocket connection limits.
#[derive(Clone, Debug)]
pub struct WsConfig {
    pub(crate) max_payload_length: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) backpressure_limit: usize,
    pub(crate) compression: bool,
}

impl WsConfig {
    /// Largest accepted message or frame, in bytes.
    pub fn max_payload_length(mut self, bytes: usize) -> Self {
        self.max_payload_length = bytes;
        self
    }

    /// Connections with no inbound traffic for this long are closed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Queued outbound bytes above which `send` reports backpressure.
    pub fn backpressure_limit(mut self, bytes: usize) -> Self {
        self.backpressure_limit = bytes;
        self
    }

    /// Recorded only: per-message deflate is not negotiated.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_payload_length: 16 * 1024 * 1024,
            idle_timeout: Duration::from_secs(120),
            backpressure_limit: 1024 * 1024,
            compression: false,
        }
    }
}
