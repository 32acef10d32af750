//! Accept loop and graceful shutdown.
//!
//! On SIGTERM or Ctrl-C the listener stops accepting, every open connection
//! is asked to finish its in-flight request and close, and
//! [`Server::serve`] returns once the last one is gone.
//!
//! Upgraded WebSocket connections leave the HTTP connection at `101` and are
//! not waited for.
//!
//! [`Server::serve_with_shutdown`] takes any future as the trigger.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app::App;
use crate::context::ClientAddr;
use crate::error::Error;

/// The HTTP server.
pub struct Server {
    listen: Listen,
}

enum Listen {
    Addr(SocketAddr),
    Bound(TcpListener),
}

impl Server {
    /// A server that binds `addr` once [`serve`](Server::serve) starts.
    ///
    /// # Panics
    ///
    /// Panics unless `addr` parses as a socket address.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tsu_core::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { listen: Listen::Addr(addr) }
    }

    /// Serves on a listener the caller already bound, e.g. to port `0`.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listen: Listen::Bound(listener) }
    }

    /// Starts accepting connections and dispatching them through `app`.
    ///
    /// Stops on SIGTERM or Ctrl-C and returns when in-flight requests have
    /// drained.
    pub async fn serve(self, app: impl Into<App>) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Like [`serve`](Self::serve), stopping when `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        app: impl Into<App>,
        signal: impl Future<Output = ()> + Send,
    ) -> Result<(), Error> {
        let app = app.into();
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Bound(listener) => listener,
        };
        let idle_timeout = app.config().idle_timeout;

        info!(addr = %listener.local_addr()?, routes = app.routes().len(), "tsu listening");

        // Every connection task watches this token to start its own graceful close.
        let stop = CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Shutdown first: a queued backlog must not delay it.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(connection(stream, remote_addr, app.clone(), idle_timeout, stop.clone()));
                }

                // reap
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        stop.cancel();
        while tasks.join_next().await.is_some() {}

        info!("tsu stopped");
        Ok(())
    }
}

/// Serves one TCP connection until the peer leaves or `stop` fires.
async fn connection(
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    app: App,
    idle_timeout: Option<Duration>,
    stop: CancellationToken,
) {
    let svc = service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(ClientAddr(remote_addr));
        let app = app.clone();
        async move { Ok::<_, Infallible>(app.handle(req).await.into_inner()) }
    });

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client negotiates.
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    if let Some(idle) = idle_timeout {
        builder.http1().timer(TokioTimer::new()).header_read_timeout(idle);
    }

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = stop.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    match result {
        Ok(()) => debug!(peer = %remote_addr, "connection closed"),
        Err(e) => error!(peer = %remote_addr, "connection error: {e}"),
    }
}

/// SIGTERM or Ctrl-C, whichever comes first. Ctrl-C only off Unix.
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
