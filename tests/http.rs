use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tsu_core::{App, Config, Context, Method, RouteOptions, Router, Schema, Schemas, Server};

async fn start(app: impl Into<App>) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), tsu_core::Error>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(Server::from_listener(listener).serve_with_shutdown(app.into(), async {
        let _ = stopped.await;
    }));
    (addr, stop, task)
}

/// Sends one HTTP/1.1 request with `connection: close` and returns the raw response.
async fn roundtrip(addr: SocketAddr, method: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("{method} {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    raw
}

fn body(raw: &str) -> &str {
    raw.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or_default()
}

fn router() -> Router {
    Router::new()
        .route(
            Method::Get,
            "/users/:id",
            |ctx: Context| async move { ctx.json(&serde_json::json!({ "id": ctx.param("id") })) },
            RouteOptions::new().schemas(Schemas::new().params(Schema::object().field("id", Schema::string().uuid()))),
        )
        .get("/files/*", |ctx: Context| async move { ctx.param("*").unwrap_or_default().to_owned() })
        .get("/whoami", |ctx: Context| async move {
            match ctx.client_addr() {
                Some(addr) => addr.ip().to_string(),
                None => "unknown".to_owned(),
            }
        })
}

#[tokio::test]
async fn validates_params_over_the_wire() {
    let (addr, stop, task) = start(router()).await;

    let bad = roundtrip(addr, "GET", "/users/not-a-uuid").await;
    assert!(bad.starts_with("HTTP/1.1 400"), "{bad}");
    let errors: serde_json::Value = serde_json::from_str(body(&bad)).unwrap();
    assert!(errors["errors"]["params"]["id"].is_array());

    let id = "11111111-1111-1111-1111-111111111111";
    let good = roundtrip(addr, "GET", &format!("/users/{id}")).await;
    assert!(good.starts_with("HTTP/1.1 200"), "{good}");
    let user: serde_json::Value = serde_json::from_str(body(&good)).unwrap();
    assert_eq!(user["id"], id);

    let _ = stop.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn wildcard_captures_the_remaining_path() {
    let (addr, stop, task) = start(router()).await;

    let raw = roundtrip(addr, "GET", "/files/a/b/c.txt").await;
    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    assert_eq!(body(&raw), "a/b/c.txt");

    let _ = stop.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn handlers_see_the_peer_address() {
    let (addr, stop, task) = start(router()).await;

    let raw = roundtrip(addr, "GET", "/whoami").await;
    assert_eq!(body(&raw), "127.0.0.1");

    let _ = stop.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_methods_are_not_found() {
    let (addr, stop, task) = start(router()).await;

    let raw = roundtrip(addr, "PURGE", "/files/x").await;
    assert!(raw.starts_with("HTTP/1.1 404"), "{raw}");

    let _ = stop.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stalled_headers_hit_the_idle_timeout() {
    let app = App::new(router(), Config::new().idle_timeout(Duration::from_millis(100)));
    let (addr, stop, task) = start(app).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /whoami HTTP/1.1\r\nhost: loc").await.unwrap();

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "connection stayed open past the idle timeout");

    let _ = stop.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_requests() {
    let app = Router::new().get("/slow", |_ctx: Context| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        "done"
    });
    let (addr, stop, task) = start(app).await;

    let request = tokio::spawn(roundtrip(addr, "GET", "/slow"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = stop.send(());

    let raw = request.await.unwrap();
    assert_eq!(body(&raw), "done");
    task.await.unwrap().unwrap();
}
