//! Minimal tsu example: validated JSON endpoints, an auth-guarded group,
//! a chat WebSocket and health checks.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/11111111-1111-1111-1111-111111111111
//!   curl http://localhost:3000/users/not-a-uuid
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice","email":"alice@example.com"}'
//!   curl -H 'authorization: Bearer demo' http://localhost:3000/admin/stats
//!   websocat 'ws://localhost:3000/chat?name=bob'
//!   curl http://localhost:3000/healthz

use std::time::Duration;

use http::StatusCode;
use serde::Deserialize;
use tsu_core::ws::{Message, WsHandlers};
use tsu_core::{
    App, Config, Context, CookieOptions, HttpError, Json, Method, Middleware, Next, RequestLogger, RouteOptions,
    Router, Schema, Schemas, Server, health,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let router = Router::new()
        .middleware(Middleware::chained(powered_by))
        .route(
            Method::Get,
            "/users/:id",
            get_user,
            RouteOptions::new()
                .schemas(Schemas::new().params(Schema::object().field("id", Schema::string().uuid())))
                .doc(serde_json::json!({ "summary": "Fetch one user" })),
        )
        .route(
            Method::Post,
            "/users",
            create_user,
            RouteOptions::new().schemas(
                Schemas::new().body(
                    Schema::object()
                        .field("name", Schema::string().min_length(1))
                        .field("email", Schema::string().email()),
                ),
            ),
        )
        .route(
            Method::Get,
            "/reports/slow",
            slow_report,
            RouteOptions::new().timeout(Duration::from_millis(500)),
        )
        .group("/admin", vec![require_bearer()], |g| g.get("/stats", stats))
        .ws(
            "/chat",
            WsHandlers::new()
                .schemas(Schemas::new().query(Schema::object().field("name", Schema::string())))
                .on_open(|conn| async move {
                    let name = conn.context().query_param("name").unwrap_or("anon").to_owned();
                    conn.send(format!("welcome, {name}"));
                })
                .on_message(|conn, msg| async move {
                    if let Message::Text(text) = msg {
                        conn.send(text.as_str().to_uppercase());
                    }
                })
                .on_close(|_conn, code, reason| async move {
                    tracing::info!(code, %reason, "chat client left");
                }),
        )
        .get("/healthz", health::liveness)
        .get("/readyz", health::readiness);

    let app = App::new(router, Config::new().logger(RequestLogger::Tracing));
    for route in app.routes() {
        tracing::debug!(method = %route.method, path = %route.path, "registered");
    }

    Server::bind("0.0.0.0:3000")
        .serve(app)
        .await
        .expect("server error");
}

async fn powered_by(ctx: Context, next: Next) -> Result<tsu_core::Response, HttpError> {
    let mut response = next.run(ctx).await?;
    response.headers_mut().insert("x-powered-by", http::HeaderValue::from_static("tsu"));
    Ok(response)
}

fn require_bearer() -> Middleware {
    Middleware::terminal(|ctx| {
        Box::pin(async move {
            let token = ctx
                .header("authorization")
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(str::to_owned);
            match token {
                Some(token) => {
                    ctx.state_mut().insert("token", token);
                    Ok(None)
                }
                None => Err(HttpError::unauthorized("bearer token required")),
            }
        })
    })
}

// GET /users/:id. The params schema has already checked the UUID.
async fn get_user(ctx: Context) -> serde_json::Value {
    serde_json::json!({ "id": ctx.param("id"), "name": "alice" })
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct NewUser {
    name: String,
    email: String,
}

// POST /users → 201 with a session cookie.
async fn create_user(mut ctx: Context) -> Result<tsu_core::Response, HttpError> {
    let user: NewUser = ctx.body_as().await?;
    ctx.set_cookie("session", "demo", &CookieOptions::new().path("/").http_only());
    ctx.set_header("location", "/users/99");
    Ok(ctx.json_with_status(StatusCode::CREATED, &user))
}

// Cooperates with the timeout guard through the cancellation token.
async fn slow_report(ctx: Context) -> Result<&'static str, HttpError> {
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(2)) => Ok("report"),
        () = ctx.signal().cancelled() => Err(HttpError::internal("report aborted")),
    }
}

async fn stats(ctx: Context) -> Json<serde_json::Value> {
    let token = ctx.state().get::<String>("token").cloned().unwrap_or_default();
    Json(serde_json::json!({ "uptime_s": 42, "token_len": token.len() }))
}
