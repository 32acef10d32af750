//! WebSocket upgrade bridge.
//!
//! A WebSocket route is an ordinary route registered under
//! [`Slot::Upgrade`](crate::Slot::Upgrade). A `GET` carrying
//! `Upgrade: websocket` is looked up there instead of under `GET`, and runs
//! the same middleware and validation chain as any HTTP route, so
//! authentication can refuse the upgrade with a plain 401. Only when the
//! chain reaches the end does the bridge answer `101 Switching Protocols` and
//! take the connection over.
//!
//! ```text
//! pending ──(101 + hyper upgrade)──▶ established ──▶ closing ──▶ closed
//! ```
//!
//! The bridge owns the first transition. Everything after it is driven by
//! the socket: inbound frames, [`WsConnection::close`], the idle timer.
//!
//! ```rust,no_run
//! use tsu_core::{Router, ws::WsHandlers};
//!
//! let app = Router::new().ws(
//!     "/chat",
//!     WsHandlers::new()
//!         .on_open(|conn| async move {
//!             conn.send("hi");
//!         })
//!         .on_message(|conn, msg| async move {
//!             if msg.is_text() {
//!                 conn.send(msg);
//!             }
//!         }),
//! );
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tracing::{debug, warn};
use uuid::Uuid;

pub use tokio_tungstenite::tungstenite::Message;

use crate::config::WsConfig;
use crate::context::Context;
use crate::error::HttpError;
use crate::middleware::{ChainFn, Middleware, MiddlewareResult, Next};
use crate::response::Response;
use crate::router::RouteOptions;
use crate::validation::Schemas;

/// Close code reported when the peer vanished without a close frame.
const ABNORMAL: u16 = 1006;
/// Close code reported when the peer sent a close frame without a code.
const NO_STATUS: u16 = 1005;

type OpenFn = Arc<dyn Fn(WsConnection) -> BoxFuture<'static, ()> + Send + Sync>;
type MessageFn = Arc<dyn Fn(WsConnection, Message) -> BoxFuture<'static, ()> + Send + Sync>;
type CloseFn = Arc<dyn Fn(WsConnection, u16, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// The event callbacks of one WebSocket route.
#[derive(Clone, Default)]
pub(crate) struct WsCallbacks {
    open: Option<OpenFn>,
    message: Option<MessageFn>,
    close: Option<CloseFn>,
    drain: Option<OpenFn>,
}

/// Builder for a WebSocket route: event callbacks plus the schemas and
/// middleware guarding the upgrade.
#[derive(Default)]
pub struct WsHandlers {
    callbacks: WsCallbacks,
    options: RouteOptions,
}

impl WsHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once the connection is established, before any inbound message
    /// is delivered.
    pub fn on_open<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WsConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.open = Some(Arc::new(move |conn: WsConnection| -> BoxFuture<'static, ()> {
            Box::pin(f(conn))
        }));
        self
    }

    /// Runs for every text or binary message, in arrival order.
    pub fn on_message<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WsConnection, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.message = Some(Arc::new(
            move |conn: WsConnection, msg: Message| -> BoxFuture<'static, ()> { Box::pin(f(conn, msg)) },
        ));
        self
    }

    /// Runs once after the connection is gone, with the close code and reason.
    pub fn on_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WsConnection, u16, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.close = Some(Arc::new(
            move |conn: WsConnection, code: u16, reason: String| -> BoxFuture<'static, ()> {
                Box::pin(f(conn, code, reason))
            },
        ));
        self
    }

    /// Runs when the outbound queue empties after `send` reported backpressure.
    pub fn on_drain<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WsConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.drain = Some(Arc::new(move |conn: WsConnection| -> BoxFuture<'static, ()> {
            Box::pin(f(conn))
        }));
        self
    }

    pub fn schemas(mut self, schemas: Schemas) -> Self {
        self.options.schemas = schemas;
        self
    }

    /// Appends a middleware guarding the upgrade.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.options.middleware.push(middleware);
        self
    }

    pub(crate) fn into_parts(self) -> (Arc<WsCallbacks>, RouteOptions) {
        (Arc::new(self.callbacks), self.options)
    }
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WsState {
    Pending,
    Established,
    Closing,
    Closed,
}

/// Outcome of [`WsConnection::send`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendStatus {
    /// Queued; carries the message length.
    Sent(usize),
    /// Queued, but the outbound queue now holds more than the configured
    /// backpressure limit. Carries the queued byte count. `on_drain` fires
    /// once it empties.
    Backpressure(usize),
    /// Not queued: the connection is not open.
    Dropped,
}

/// Handle to one live WebSocket connection. Cheap to clone.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    ctx: Context,
    tx: mpsc::UnboundedSender<Message>,
    state: Mutex<WsState>,
    queued: AtomicUsize,
    limit: usize,
    needs_drain: AtomicBool,
}

impl WsConnection {
    fn new(ctx: Context, tx: mpsc::UnboundedSender<Message>, limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                ctx,
                tx,
                state: Mutex::new(WsState::Pending),
                queued: AtomicUsize::new(0),
                limit,
                needs_drain: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The request context as it left the upgrade chain: validated params,
    /// query and whatever middleware put in the state bag.
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn state(&self) -> WsState {
        *self.inner.state.lock()
    }

    fn set_state(&self, state: WsState) {
        *self.inner.state.lock() = state;
    }

    /// Queues a message. Never blocks.
    pub fn send(&self, msg: impl Into<Message>) -> SendStatus {
        if self.state() != WsState::Established {
            return SendStatus::Dropped;
        }
        self.enqueue(msg.into())
    }

    fn enqueue(&self, msg: Message) -> SendStatus {
        let len = msg.len();
        // Count before handing over so the writer never subtracts first.
        let queued = self.inner.queued.fetch_add(len, Ordering::SeqCst) + len;
        if self.inner.tx.send(msg).is_err() {
            self.inner.queued.fetch_sub(len, Ordering::SeqCst);
            return SendStatus::Dropped;
        }
        if queued > self.inner.limit {
            self.inner.needs_drain.store(true, Ordering::SeqCst);
            SendStatus::Backpressure(queued)
        } else {
            SendStatus::Sent(len)
        }
    }

    /// Starts the closing handshake. A no-op unless the connection is open.
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if *state != WsState::Established {
                return;
            }
            *state = WsState::Closing;
        }
        self.enqueue(Message::Close(Some(close_frame(code, reason))));
    }

    /// Bytes handed to `send` but not yet written to the socket.
    pub fn buffered(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("path", &self.inner.ctx.path())
            .finish()
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame { code: CloseCode::from(code), reason: reason.to_owned().into() }
}

/// The final stage of a WebSocket route chain: answer 101 and hand the
/// connection to [`establish`].
pub(crate) fn endpoint(callbacks: Arc<WsCallbacks>, config: WsConfig) -> ChainFn {
    if config.compression {
        warn!("websocket compression requested but not supported; continuing without it");
    }
    Arc::new(move |mut ctx: Context, _next: Next| -> BoxFuture<'static, MiddlewareResult> {
        let callbacks = Arc::clone(&callbacks);
        let config = config.clone();
        Box::pin(async move {
            let accept = ctx.header("sec-websocket-key").map(|key| derive_accept_key(key.as_bytes()));
            let on_upgrade = ctx.extensions_mut().remove::<OnUpgrade>();
            let (Some(accept), Some(on_upgrade)) = (accept, on_upgrade) else {
                return Err(HttpError::internal("websocket upgrade is not possible on this request"));
            };

            tokio::spawn(establish(on_upgrade, ctx, callbacks, config));

            Ok(Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(UPGRADE, "websocket")
                .header(CONNECTION, "Upgrade")
                .header(SEC_WEBSOCKET_ACCEPT, accept)
                .no_body())
        })
    })
}

/// Completes the transport upgrade and runs the connection to its end.
async fn establish(on_upgrade: OnUpgrade, ctx: Context, callbacks: Arc<WsCallbacks>, config: WsConfig) {
    let (tx, rx) = mpsc::unbounded_channel();
    let path = ctx.path().to_owned();
    let conn = WsConnection::new(ctx, tx, config.backpressure_limit);

    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(%path, error = %e, "websocket upgrade failed");
            conn.set_state(WsState::Closed);
            return;
        }
    };

    let protocol = WebSocketConfig::default()
        .max_message_size(Some(config.max_payload_length))
        .max_frame_size(Some(config.max_payload_length));
    let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(protocol)).await;

    conn.set_state(WsState::Established);
    debug!(id = %conn.id(), %path, "websocket established");

    if let Some(open) = &callbacks.open {
        open(conn.clone()).await;
    }

    let (code, reason) = drive(socket, rx, &conn, &callbacks, &config).await;

    conn.set_state(WsState::Closed);
    debug!(id = %conn.id(), code, "websocket closed");
    if let Some(close) = &callbacks.close {
        close(conn.clone(), code, reason).await;
    }
}

/// Pumps inbound frames to `on_message` and queued messages to the socket
/// until either side closes or the idle timer fires.
async fn drive<S>(
    mut socket: WebSocketStream<S>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    conn: &WsConnection,
    callbacks: &WsCallbacks,
    config: &WsConfig,
) -> (u16, String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + config.idle_timeout;
    let mut closed: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Close(frame))) => {
                    // Keep polling so the close reply gets flushed.
                    conn.set_state(WsState::Closing);
                    closed.get_or_insert(match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (NO_STATUS, String::new()),
                    });
                }
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    deadline = Instant::now() + config.idle_timeout;
                    if let Some(on_message) = &callbacks.message {
                        on_message(conn.clone(), msg).await;
                    }
                }
                Some(Ok(_)) => deadline = Instant::now() + config.idle_timeout,
                Some(Err(tokio_tungstenite::tungstenite::Error::Capacity(e))) => {
                    debug!(id = %conn.id(), error = %e, "websocket message too large");
                    let frame = close_frame(CloseCode::Size.into(), "message too large");
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break closed.unwrap_or((u16::from(CloseCode::Size), "message too large".to_owned()));
                }
                Some(Err(e)) => {
                    debug!(id = %conn.id(), error = %e, "websocket read error");
                    break closed.unwrap_or((ABNORMAL, String::new()));
                }
                None => break closed.unwrap_or((ABNORMAL, String::new())),
            },

            Some(msg) = rx.recv() => {
                let len = msg.len();
                let ours = match &msg {
                    Message::Close(Some(frame)) => Some((u16::from(frame.code), frame.reason.as_str().to_owned())),
                    _ => None,
                };
                if let Err(e) = socket.send(msg).await {
                    debug!(id = %conn.id(), error = %e, "websocket write error");
                    break closed.or(ours).unwrap_or((ABNORMAL, String::new()));
                }
                if let Some(ours) = ours {
                    closed.get_or_insert(ours);
                }
                let left = conn.inner.queued.fetch_sub(len, Ordering::SeqCst) - len;
                if left == 0 && conn.inner.needs_drain.swap(false, Ordering::SeqCst) {
                    if let Some(drain) = &callbacks.drain {
                        drain(conn.clone()).await;
                    }
                }
            },

            () = tokio::time::sleep_until(deadline) => {
                debug!(id = %conn.id(), "websocket idle timeout");
                let frame = close_frame(CloseCode::Away.into(), "idle timeout");
                let _ = socket.send(Message::Close(Some(frame))).await;
                break closed.unwrap_or((u16::from(CloseCode::Away), "idle timeout".to_owned()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{ctx, request};
    use crate::middleware::dispatch;

    fn open_connection(limit: usize) -> (WsConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new(ctx(request("GET", "/chat?room=1"), ""), tx, limit);
        conn.set_state(WsState::Established);
        (conn, rx)
    }

    #[test]
    fn send_is_dropped_until_established() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new(ctx(request("GET", "/chat"), ""), tx, 16);
        assert_eq!(conn.state(), WsState::Pending);
        assert_eq!(conn.send("hi"), SendStatus::Dropped);
    }

    #[test]
    fn reports_backpressure_past_the_limit() {
        let (conn, mut rx) = open_connection(4);
        assert_eq!(conn.send("abc"), SendStatus::Sent(3));
        assert_eq!(conn.send("defg"), SendStatus::Backpressure(7));
        assert_eq!(conn.buffered(), 7);
        assert_eq!(rx.try_recv().unwrap().into_text().unwrap().as_str(), "abc");
    }

    #[test]
    fn close_moves_to_closing_once() {
        let (conn, mut rx) = open_connection(1024);
        conn.close(1000, "bye");
        assert_eq!(conn.state(), WsState::Closing);
        assert!(matches!(rx.try_recv().unwrap(), Message::Close(Some(_))));

        conn.close(1000, "again");
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.send("late"), SendStatus::Dropped);
    }

    #[test]
    fn exposes_the_request_context() {
        let (conn, _rx) = open_connection(1024);
        assert_eq!(conn.context().path(), "/chat");
        assert_eq!(conn.context().query_param("room"), Some("1"));
    }

    #[tokio::test]
    async fn upgrade_without_a_transport_is_an_internal_error() {
        let chain: Arc<[ChainFn]> = vec![endpoint(Arc::default(), WsConfig::default())].into();
        let req = request("GET", "/chat")
            .header("upgrade", "websocket")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        let err = dispatch(chain, ctx(req, "")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
