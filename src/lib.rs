//! # tsu
//!
//! The request-handling core of the tsu HTTP + WebSocket server.
//!
//! ## What it does
//!
//! - Trie routing: static segments beat `:params`, which beat a trailing `*`.
//!   Ambiguous routes are refused at registration, never at request time.
//! - Onion middleware: global, group and route middleware wrap the handler.
//!   Any stage can answer early; the rest of the chain then never runs.
//! - Schema validation of params, query and body through a pluggable
//!   [`Validator`], with per-location error reports.
//! - Per-route timeouts that fire a cancellation token and answer `504`.
//! - WebSocket routes that run the same middleware chain before upgrading.
//!
//! What it leaves to the proxy in front: TLS, body-size limits, compression.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tsu_core::{Config, Context, HttpError, Method, RequestLogger, RouteOptions, Router, Schema, Schemas, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::new()
//!         .route(
//!             Method::Get,
//!             "/users/:id",
//!             get_user,
//!             RouteOptions::new()
//!                 .schemas(Schemas::new().params(Schema::object().field("id", Schema::string().uuid())))
//!                 .timeout(Duration::from_secs(2)),
//!         )
//!         .post("/users", create_user);
//!
//!     let app = tsu_core::App::new(app, Config::new().logger(RequestLogger::Tracing));
//!     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
//! }
//!
//! async fn get_user(ctx: Context) -> serde_json::Value {
//!     serde_json::json!({ "id": ctx.param("id") })
//! }
//!
//! async fn create_user(mut ctx: Context) -> Result<serde_json::Value, HttpError> {
//!     let body = ctx.parse_body().await;
//!     if body["name"] == "root" {
//!         return Err(HttpError::conflict("name already taken"));
//!     }
//!     Ok(body.clone())
//! }
//! ```

mod app;
mod config;
mod context;
mod cookie;
mod error;
mod handler;
mod logger;
mod method;
mod response;
mod router;
mod server;
mod timeout;
mod validation;

pub mod health;
pub mod middleware;
pub mod ws;

pub use app::{App, RequestInfo};
pub use config::{Config, ErrorHandler, WsConfig};
pub use context::{ClientAddr, Context, State};
pub use cookie::{CookieOptions, SameSite};
pub use error::{BoxError, Error, HttpError, RouteError};
pub use handler::Handler;
pub use logger::{RequestLog, RequestLogger};
pub use method::{Method, Slot};
pub use middleware::{Middleware, MiddlewareResult, Next};
pub use response::{ContentType, IntoReply, Json, Reply, Response, ResponseBuilder};
pub use router::{Group, RouteInfo, RouteOptions, Router};
pub use server::Server;
pub use validation::{
    FieldErrors, Location, Outcome, Schema, SchemaRef, SchemaValidator, Schemas, ValidationErrors, Validator,
};
