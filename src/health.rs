//! Liveness and readiness probes.
//!
//! `liveness` answers as long as the accept loop and the pipeline work.
//! `readiness` answers unconditionally; applications that need a warm-up or
//! a dependency check mount their own handler on the readiness path instead.
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use tsu_core::{Context, Response, Router, health};
//!
//! async fn ready(ctx: Context) -> Response {
//!     match ctx.state().get::<bool>("db") {
//!         Some(true) => ctx.text("ready"),
//!         _ => ctx.status_only(StatusCode::SERVICE_UNAVAILABLE),
//!     }
//! }
//!
//! let router = Router::new()
//!     .get("/healthz", health::liveness)
//!     .get("/readyz", ready);
//! ```

use crate::{Context, Response};

/// `200 text/plain` with body `ok`.
pub async fn liveness(ctx: Context) -> Response {
    ctx.text("ok")
}

/// `200 text/plain` with body `ready`.
pub async fn readiness(ctx: Context) -> Response {
    ctx.text("ready")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{App, Router};
    use http_body_util::Full;

    #[tokio::test]
    async fn probes_answer_plain_text() {
        let app: App = Router::new()
            .get("/healthz", liveness)
            .get("/readyz", readiness)
            .into();

        for (path, body) in [("/healthz", "ok"), ("/readyz", "ready")] {
            let req = http::Request::get(path).body(Full::<bytes::Bytes>::default()).unwrap();
            let response = app.handle(req).await;
            assert_eq!(response.status(), http::StatusCode::OK);
            assert_eq!(response.body().as_ref(), body.as_bytes());
        }
    }
}
