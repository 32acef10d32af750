//! Error types.
//!
//! Three layers, three types:
//!
//! - [`HttpError`]: request-level failures. Anything a middleware, the
//!   validation stage, or a handler can fail with. The error stage turns it
//!   into a JSON [`Response`] with the matching status.
//! - [`RouteError`]: registration-time failures. A bad route table is a
//!   programming error and surfaces before the server ever binds.
//! - [`Error`]: infrastructure failures: binding a port, accepting a socket.

use http::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::response::Response;
use crate::validation::ValidationErrors;

/// A boxed, thread-safe error used as the source of internal failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Infrastructure failure returned by [`Server::serve`](crate::Server::serve).
#[derive(Debug, Error)]
#[error("io: {0}")]
pub struct Error(#[from] std::io::Error);

/// A route could not be registered.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Two routes bind differently named parameters at the same tree position,
    /// e.g. `/users/:id` and `/users/:user_id/posts`.
    #[error("route `{pattern}`: parameter `:{attempted}` conflicts with existing `:{existing}` at the same position")]
    ParamConflict {
        pattern: String,
        existing: String,
        attempted: String,
    },

    #[error("route `{method} {pattern}` is already registered")]
    Duplicate { method: String, pattern: String },

    #[error("route `{pattern}`: `*` must be the last segment")]
    WildcardNotLast { pattern: String },

    #[error("route `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
}

/// A request-level failure, rendered by the error stage.
///
/// Return it from a middleware or handler (`Err(HttpError::unauthorized(..))`)
/// to stop the pipeline. Every variant maps to exactly one status code.
#[derive(Debug, Error)]
pub enum HttpError {
    /// One or more request locations failed schema validation.
    #[error("validation failed")]
    Validation(ValidationErrors),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    /// Raised when no route matches the request.
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TooManyRequests(String),

    /// Raised by the timeout guard when a handler outlives its budget.
    #[error("{0}")]
    GatewayTimeout(String),

    /// Anything unanticipated. The source is logged, never sent to the client.
    #[error("internal server error")]
    Internal(#[source] BoxError),
}

impl HttpError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::TooManyRequests(message.into())
    }

    pub fn gateway_timeout() -> Self {
        Self::GatewayTimeout("Gateway Timeout".to_owned())
    }

    pub fn internal(source: impl Into<BoxError>) -> Self {
        Self::Internal(source.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_)      => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_)    => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_)       => StatusCode::FORBIDDEN,
            Self::NotFound(_)        => StatusCode::NOT_FOUND,
            Self::Conflict(_)        => StatusCode::CONFLICT,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::GatewayTimeout(_)  => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_)        => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The client-facing message. Internal errors never leak their source.
    pub fn message(&self) -> String {
        match self {
            Self::Validation(_) => "Validation failed".to_owned(),
            Self::Internal(_)   => "Internal Server Error".to_owned(),
            other               => other.to_string(),
        }
    }

    /// Default rendering: `{ "message": …, "errors"?: { location: { field: [..] } } }`.
    pub fn to_response(&self) -> Response {
        let body = match self {
            Self::Validation(errors) => json!({ "message": self.message(), "errors": errors }),
            _ => json!({ "message": self.message() }),
        };
        Response::builder().status(self.status()).json(&body)
    }
}

impl From<ValidationErrors> for HttpError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Location;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(HttpError::unauthorized("no").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(HttpError::forbidden("no").status(), StatusCode::FORBIDDEN);
        assert_eq!(HttpError::not_found("gone").status(), StatusCode::NOT_FOUND);
        assert_eq!(HttpError::conflict("dup").status(), StatusCode::CONFLICT);
        assert_eq!(HttpError::too_many_requests("slow").status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(HttpError::gateway_timeout().status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(HttpError::internal("boom").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_errors_do_not_leak_their_source() {
        let resp = HttpError::internal("db password is hunter2").to_response();
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body, json!({ "message": "Internal Server Error" }));
    }

    #[test]
    fn validation_errors_render_per_location() {
        let mut errors = ValidationErrors::default();
        errors.add(Location::Params, "id", "must be a valid UUID");

        let resp = HttpError::from(errors).to_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["message"], "Validation failed");
        assert_eq!(body["errors"]["params"]["id"][0], "must be a valid UUID");
    }
}
