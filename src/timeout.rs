//! Per-route timeout guard.
//!
//! With a timeout configured, the handler runs as its own task and races a
//! timer. If the timer wins, the context's cancellation token fires and the
//! request resolves to [`HttpError::GatewayTimeout`]. The handler task is
//! detached, not aborted: cancellation is cooperative, and a handler that
//! watches [`Context::signal`] can stop its downstream work. If the handler
//! wins, the timer is dropped with the `select!`.
//!
//! Exactly one outcome leaves the guard per request.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::context::Context;
use crate::error::HttpError;
use crate::handler::BoxedHandler;
use crate::middleware::{ChainFn, MiddlewareResult, Next};
use crate::response::{Reply, normalize};

/// Runs `handler`, bounded by `limit` when set.
pub(crate) async fn guard(
    handler: BoxedHandler,
    ctx: Context,
    limit: Option<Duration>,
) -> Result<Reply, HttpError> {
    let Some(limit) = limit else {
        return Ok(handler.call(ctx).await);
    };

    let signal = ctx.signal().clone();
    let path = ctx.path().to_owned();
    let mut task = tokio::spawn(handler.call(ctx));

    tokio::select! {
        joined = &mut task => joined.map_err(HttpError::internal),
        () = tokio::time::sleep(limit) => {
            signal.cancel();
            warn!(%path, timeout_ms = limit.as_millis() as u64, "handler timed out");
            Err(HttpError::gateway_timeout())
        }
    }
}

/// The final stage of every HTTP chain: guard, then normalize.
pub(crate) fn endpoint(handler: BoxedHandler, limit: Option<Duration>) -> ChainFn {
    Arc::new(move |ctx: Context, _next: Next| -> BoxFuture<'static, MiddlewareResult> {
        let handler = Arc::clone(&handler);
        Box::pin(async move { normalize(guard(handler, ctx, limit).await?) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{ctx, request};
    use crate::handler::Handler;
    use crate::middleware::dispatch;
    use http::StatusCode;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    fn chain(handler: impl Handler, limit: Option<Duration>) -> Arc<[ChainFn]> {
        vec![endpoint(handler.into_boxed_handler(), limit)].into()
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_fires_the_signal() {
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::default();
        let slot = Arc::clone(&seen);
        let handler = move |ctx: Context| {
            *slot.lock() = Some(ctx.signal().clone());
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }
        };

        let err = dispatch(chain(handler, Some(Duration::from_millis(20))), ctx(request("GET", "/slow"), ""))
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        let token = seen.lock().clone().expect("handler ran");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cooperative_handler_observes_cancellation() {
        let (tx, rx) = tokio::sync::oneshot::channel::<&'static str>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let handler = move |ctx: Context| {
            let tx = Arc::clone(&tx);
            async move {
                ctx.signal().cancelled().await;
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send("stopped");
                }
                "unreachable"
            }
        };

        let err = dispatch(chain(handler, Some(Duration::from_millis(10))), ctx(request("GET", "/"), ""))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(rx.await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn fast_handler_wins_the_race() {
        let handler = |ctx: Context| async move { ctx.text("quick") };
        let response = dispatch(chain(handler, Some(Duration::from_secs(5))), ctx(request("GET", "/"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"quick");
    }

    #[tokio::test]
    async fn panicking_handler_under_a_timeout_is_an_internal_error() {
        let handler = |ctx: Context| async move {
            if ctx.path() == "/" {
                panic!("boom");
            }
            "unreachable"
        };
        let err = dispatch(chain(handler, Some(Duration::from_secs(5))), ctx(request("GET", "/"), ""))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn results_are_normalized() {
        let handler = |_ctx: Context| async move { serde_json::json!({ "id": 1 }) };
        let response = dispatch(chain(handler, None), ctx(request("GET", "/"), "")).await.unwrap();
        assert_eq!(response.header("content-type"), Some("application/json"));
    }
}
