//! End-to-end tests of the HTTP frontend on a real socket.
//!
//! # Test Coverage
//!
//! - Routing over the wire, 404 and headers set by middleware
//! - Route timeouts: 504, the exit reason, and disarming on completion
//! - Body size limit (413)
//! - Terminating from a handler and from the server handle
//! - The server-created hook

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use wsgilite::lifecycle::ExitReason;
use wsgilite::server::bind_exclusive;
use wsgilite::{App, DefineRoutes, Reply, Role, RouteHandler, ServerConfig, ServerInfo};

mod common;

fn app_with(config: ServerConfig) -> App {
    App::new(ServerConfig {
        process_num: 0,
        shutdown_grace_ms: 500,
        ..config
    })
}

fn test_app() -> App {
    app_with(ServerConfig::default())
}

#[tokio::test]
async fn test_serves_routes_over_http() {
    let app = test_app();
    app.add_middleware(
        None,
        RouteHandler::from_fn(|ex| {
            ex.response.set_header("x-demo", "yes")?;
            Ok(Reply::Empty)
        }),
    );
    app.get("/hello/:name", RouteHandler::from_fn(|ex| {
        let name = ex.context.get_str("name").unwrap_or_default();
        Ok(Reply::from(format!("hello {name}")))
    }))
    .unwrap();
    let server = common::start(&app).await;

    let response = common::get(server.addr(), "/hello/ada%20l").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hello ada l");
    assert_eq!(response.header("x-demo"), Some("yes"));
    assert_eq!(
        response.header("content-type"),
        Some("text/plain; charset=utf-8")
    );

    let missing = common::get(server.addr(), "/nope").await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body, "404 File not found.");

    assert_eq!(server.stop().await, ExitReason::Terminated);
}

#[tokio::test]
async fn test_route_timeout_returns_504_and_stops_server() {
    let app = test_app();
    app.get(
        "/slow",
        RouteHandler::from_async(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Reply::from("too late"))
        }),
    )
    .unwrap()
    .set_timeout_ms(50)
    .set_timeout_message("took too long");
    let server = common::start(&app).await;

    let response = common::get(server.addr(), "/slow").await;
    assert_eq!(response.status, 504);
    assert_eq!(response.body, "took too long");

    let reason = tokio::time::timeout(Duration::from_secs(5), server.join())
        .await
        .expect("server did not stop after the timeout");
    assert_eq!(
        reason,
        ExitReason::RouteTimeout {
            rule: "/slow".to_string(),
            timeout_ms: 50
        }
    );
}

#[tokio::test]
async fn test_finished_route_disarms_timeout() {
    let app = test_app();
    app.get("/fast", RouteHandler::from_fn(|_| Ok(Reply::from("quick"))))
        .unwrap()
        .set_timeout_ms(30);
    let server = common::start(&app).await;

    let response = common::get(server.addr(), "/fast").await;
    assert_eq!(response.status, 200);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!app.lifecycle().is_stopping());
    server.stop().await;
}

#[tokio::test]
async fn test_non_positive_timeout_disables_guard() {
    let app = test_app();
    app.get(
        "/unbounded",
        RouteHandler::from_async(|_| async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(Reply::from("done"))
        }),
    )
    .unwrap()
    .set_timeout_ms(0);
    let server = common::start(&app).await;

    let response = common::get(server.addr(), "/unbounded").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "done");
    assert!(!app.lifecycle().is_stopping());
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let app = app_with(ServerConfig {
        max_body_bytes: 16,
        ..ServerConfig::default()
    });
    app.post("/upload", RouteHandler::from_fn(|_| Ok(Reply::from("stored"))))
        .unwrap();
    let server = common::start(&app).await;

    let small = common::post(server.addr(), "/upload", "text/plain", "tiny").await;
    assert_eq!(small.status, 200);

    let big = common::post(server.addr(), "/upload", "text/plain", &"x".repeat(64)).await;
    assert_eq!(big.status, 413);
    server.stop().await;
}

#[tokio::test]
async fn test_terminate_from_handler() {
    let app = test_app();
    app.get(
        "/terminate",
        RouteHandler::from_fn(|ex| {
            ex.response.send(
                http::StatusCode::OK,
                "text/plain; charset=utf-8",
                "bye",
            );
            ex.cluster().terminate();
            Ok(Reply::Empty)
        }),
    )
    .unwrap();
    let server = common::start(&app).await;

    let response = common::get(server.addr(), "/terminate").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "bye");
    let reason = tokio::time::timeout(Duration::from_secs(5), server.join())
        .await
        .unwrap();
    assert_eq!(reason, ExitReason::Terminated);
}

#[tokio::test]
async fn test_handler_errors_over_http() {
    let app = test_app();
    app.get(
        "/fail",
        RouteHandler::from_async(|_| async { Err(anyhow::anyhow!("no luck")) }),
    )
    .unwrap();
    let server = common::start(&app).await;
    let response = common::get(server.addr(), "/fail").await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body, "500 Internal Server Error\n");
    server.stop().await;
}

#[tokio::test]
async fn test_app_serve_reports_server_info() {
    let seen: Arc<Mutex<Option<ServerInfo>>> = Arc::new(Mutex::new(None));
    let mut app = test_app();
    let sink = Arc::clone(&seen);
    app.on_server_created(move |info| *sink.lock() = Some(info.clone()));
    app.get("/", RouteHandler::from_fn(|_| Ok(Reply::from("root"))))
        .unwrap();

    let listener = bind_exclusive("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Arc::new(app);
    let serving = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.serve(listener).await })
    };

    let response = common::get(addr, "/").await;
    assert_eq!(response.body, "root");

    let info = seen.lock().clone().expect("hook not called");
    assert_eq!(info.addr, addr);
    assert_eq!(info.role, Role::Single);
    assert_eq!(info.url(), format!("http://{addr}"));

    app.terminate();
    let reason = serving.await.unwrap().unwrap();
    assert_eq!(reason, ExitReason::Terminated);
}
