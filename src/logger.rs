//! Per-request access logging.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use http::StatusCode;
use tracing::info;

/// One completed request, as handed to the request logger.
#[derive(Clone, Debug)]
pub struct RequestLog {
    pub method: http::Method,
    pub path: String,
    pub status: StatusCode,
    pub duration_ms: f64,
    pub client_ip: Option<IpAddr>,
}

/// Where completed requests are reported.
///
/// Invoked once per completed HTTP request, error responses and 404s
/// included. Successful WebSocket upgrades are not reported.
#[derive(Clone, Default)]
pub enum RequestLogger {
    #[default]
    Off,
    /// One `info!` event per request on the `tsu::access` target.
    Tracing,
    Custom(Arc<dyn Fn(&RequestLog) + Send + Sync>),
}

impl RequestLogger {
    /// ```rust
    /// use tsu_core::RequestLogger;
    ///
    /// let logger = RequestLogger::custom(|log| {
    ///     eprintln!("{} {} -> {}", log.method, log.path, log.status.as_u16());
    /// });
    /// ```
    pub fn custom(f: impl Fn(&RequestLog) + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }

    pub(crate) fn log(&self, entry: &RequestLog) {
        match self {
            Self::Off => {}
            Self::Tracing => info!(
                target: "tsu::access",
                method = %entry.method,
                path = %entry.path,
                status = entry.status.as_u16(),
                duration_ms = entry.duration_ms,
                client_ip = ?entry.client_ip,
                "request completed"
            ),
            Self::Custom(f) => f(entry),
        }
    }
}

impl From<bool> for RequestLogger {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Tracing } else { Self::Off }
    }
}

impl fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("Off"),
            Self::Tracing => f.write_str("Tracing"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
