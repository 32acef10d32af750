//! Middleware and the onion-model dispatcher.
//!
//! Every route compiles to one chain: global middleware, then group
//! middleware (outermost group first), then route middleware, then the
//! validation stage, then the handler. The dispatcher walks that chain with
//! an index cursor. Each stage receives the [`Context`] by value plus a
//! [`Next`] bound to "the rest of the chain from here":
//!
//! ```text
//! request ─▶ global ─▶ group ─▶ route ─▶ validation ─▶ handler
//!                                                        │
//! response ◀──────────────────────────────────────────────┘
//! ```
//!
//! A stage short-circuits by returning a [`Response`] without calling
//! [`Next::run`]; nothing after it executes. Errors propagate out of the
//! dispatcher untouched; rendering them is the error stage's job.
//!
//! # Two shapes of middleware
//!
//! [`Middleware::chained`] gets `(ctx, next)` and can act before and after
//! the rest of the chain. [`Middleware::terminal`] only sees `&mut Context`
//! and either answers (`Some(response)`) or steps aside (`None`), in which
//! case the chain resumes automatically. Terminal middleware is adapted into
//! the chained shape once, at registration.
//!
//! # `next` runs at most once
//!
//! [`Next::run`] takes `self`, and the context moves into it, so a second call
//! does not compile:
//!
//! ```rust,compile_fail
//! use tsu_core::{Context, Middleware, Next};
//!
//! Middleware::chained(|ctx: Context, next: Next| async move {
//!     let _first = next.run(ctx).await;
//!     next.run(ctx).await
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::HttpError;
use crate::response::Response;

/// What every chain stage resolves to.
pub type MiddlewareResult = Result<Response, HttpError>;

/// The uniform, type-erased stage the dispatcher walks.
pub(crate) type ChainFn = Arc<dyn Fn(Context, Next) -> BoxFuture<'static, MiddlewareResult> + Send + Sync>;

type TerminalFn = Arc<
    dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<Option<Response>, HttpError>> + Send + Sync,
>;

/// A middleware, in one of its two shapes.
#[derive(Clone)]
pub enum Middleware {
    /// Sees only the context; the chain resumes unless it returns a response.
    Terminal(TerminalFn),
    /// Wraps the rest of the chain through [`Next`].
    Chained(ChainFn),
}

impl Middleware {
    /// Builds a middleware that decides before the rest of the chain runs.
    ///
    /// ```rust
    /// use http::StatusCode;
    /// use tsu_core::{HttpError, Middleware};
    ///
    /// let require_key = Middleware::terminal(|ctx| Box::pin(async move {
    ///     match ctx.header("x-api-key") {
    ///         Some("secret") => Ok(None),
    ///         _ => Err(HttpError::unauthorized("missing api key")),
    ///     }
    /// }));
    ///
    /// let tag = Middleware::terminal(|ctx| Box::pin(async move {
    ///     ctx.set_header("x-served-by", "tsu");
    ///     Ok(None)
    /// }));
    /// ```
    pub fn terminal<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<Option<Response>, HttpError>>
            + Send
            + Sync
            + 'static,
    {
        Self::Terminal(Arc::new(f))
    }

    /// Builds an onion middleware.
    ///
    /// ```rust
    /// use std::time::Instant;
    /// use tsu_core::{Context, Middleware, Next};
    ///
    /// let timing = Middleware::chained(|ctx: Context, next: Next| async move {
    ///     let started = Instant::now();
    ///     let mut response = next.run(ctx).await?;
    ///     let elapsed = started.elapsed().as_millis().to_string();
    ///     response.headers_mut().insert("x-response-time", elapsed.parse().unwrap());
    ///     Ok(response)
    /// });
    /// ```
    pub fn chained<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MiddlewareResult> + Send + 'static,
    {
        Self::Chained(Arc::new(move |ctx: Context, next: Next| -> BoxFuture<'static, MiddlewareResult> {
            Box::pin(f(ctx, next))
        }))
    }

    /// Adapts either shape into a chain stage.
    pub(crate) fn into_stage(self) -> ChainFn {
        match self {
            Self::Chained(stage) => stage,
            Self::Terminal(f) => Arc::new(move |mut ctx: Context, next: Next| -> BoxFuture<'static, MiddlewareResult> {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    match f(&mut ctx).await? {
                        Some(response) => Ok(response),
                        None => next.run(ctx).await,
                    }
                })
            }),
        }
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal(_) => f.write_str("Middleware::Terminal"),
            Self::Chained(_) => f.write_str("Middleware::Chained"),
        }
    }
}

/// The rest of the chain, from the stage after the current one.
///
/// Consumed by [`run`](Next::run): holding a `Next` is the capability to
/// resume the request exactly once.
pub struct Next {
    chain: Arc<[ChainFn]>,
    index: usize,
}

impl Next {
    pub(crate) fn start(chain: Arc<[ChainFn]>) -> Self {
        Self { chain, index: 0 }
    }

    /// Runs the remainder of the chain and returns whatever it produces.
    pub fn run(self, ctx: Context) -> BoxFuture<'static, MiddlewareResult> {
        let Some(stage) = self.chain.get(self.index).cloned() else {
            return Box::pin(async {
                Err(HttpError::internal("middleware chain ended without producing a response"))
            });
        };
        let next = Next { chain: self.chain, index: self.index + 1 };
        stage(ctx, next)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("len", &self.chain.len())
            .finish()
    }
}

/// Runs `chain` from the top.
pub(crate) fn dispatch(chain: Arc<[ChainFn]>, ctx: Context) -> BoxFuture<'static, MiddlewareResult> {
    Next::start(chain).run(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{ctx, request};
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint(hits: Arc<AtomicUsize>) -> ChainFn {
        Middleware::chained(move |ctx: Context, _next: Next| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.text("handler"))
            }
        })
        .into_stage()
    }

    fn recorder(log: Arc<parking_lot::Mutex<Vec<String>>>, name: &'static str) -> ChainFn {
        Middleware::chained(move |ctx: Context, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}:before"));
                let response = next.run(ctx).await;
                log.lock().push(format!("{name}:after"));
                response
            }
        })
        .into_stage()
    }

    #[tokio::test]
    async fn runs_as_an_onion() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let chain: Arc<[ChainFn]> = vec![
            recorder(Arc::clone(&log), "outer"),
            recorder(Arc::clone(&log), "inner"),
            endpoint(Arc::clone(&hits)),
        ]
        .into();

        let response = dispatch(chain, ctx(request("GET", "/"), "")).await.unwrap();
        assert_eq!(response.body().as_ref(), b"handler");
        assert_eq!(
            *log.lock(),
            ["outer:before", "inner:before", "inner:after", "outer:after"]
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_response_short_circuits_everything_after_it() {
        let later = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let deny = Middleware::terminal(|ctx| {
            Box::pin(async move { Ok(Some(ctx.status_only(StatusCode::UNAUTHORIZED))) })
        });
        let counter = {
            let later = Arc::clone(&later);
            Middleware::chained(move |ctx: Context, next: Next| {
                let later = Arc::clone(&later);
                async move {
                    later.fetch_add(1, Ordering::SeqCst);
                    next.run(ctx).await
                }
            })
        };

        let chain: Arc<[ChainFn]> =
            vec![deny.into_stage(), counter.into_stage(), endpoint(Arc::clone(&hits))].into();
        let response = dispatch(chain, ctx(request("GET", "/"), "")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminal_middleware_that_steps_aside_resumes_the_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tag = Middleware::terminal(|ctx| {
            Box::pin(async move {
                ctx.state_mut().insert("tagged", true);
                Ok(None)
            })
        });
        let check = Middleware::chained(|ctx: Context, next: Next| async move {
            assert_eq!(ctx.state().get::<bool>("tagged"), Some(&true));
            next.run(ctx).await
        });

        let chain: Arc<[ChainFn]> =
            vec![tag.into_stage(), check.into_stage(), endpoint(Arc::clone(&hits))].into();
        dispatch(chain, ctx(request("GET", "/"), "")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_propagate_out_of_the_dispatcher() {
        let hits = Arc::new(AtomicUsize::new(0));
        let fail = Middleware::terminal(|_ctx| {
            Box::pin(async move { Err(HttpError::forbidden("members only")) })
        });

        let chain: Arc<[ChainFn]> = vec![fail.into_stage(), endpoint(Arc::clone(&hits))].into();
        let err = dispatch(chain, ctx(request("GET", "/"), "")).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn running_off_the_end_is_an_internal_error() {
        let pass = Middleware::terminal(|_ctx| Box::pin(async move { Ok(None) }));
        let chain: Arc<[ChainFn]> = vec![pass.into_stage()].into();
        let err = dispatch(chain, ctx(request("GET", "/"), "")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
