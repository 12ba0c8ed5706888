//! Pipeline tests driven through the dispatcher directly, without sockets.
//!
//! # Test Coverage
//!
//! - The three handler shapes produce identical responses
//! - Middleware order, method filters, idempotent registration and removal
//! - Route parameters, 404 and 500 (plain and debug)
//! - Body decoding into the context
//! - Served-request counting in a worker

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wsgilite::dispatcher::{Dispatcher, NOT_FOUND_BODY};
use wsgilite::lifecycle::ExitReason;
use wsgilite::{
    step, App, DefineRoutes, Reply, Request, Response, Role, RouteHandler, ServerConfig, Steps,
};

struct Answer {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl Answer {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

async fn run(app: &App, request: http::Request<Bytes>) -> Answer {
    let (response, finished) = Response::channel();
    let exchange = app
        .dispatcher()
        .exchange(Request::new(request, None), response);
    if !app.dispatcher().dispatch(&exchange).await {
        Dispatcher::not_found(&exchange);
    }
    let (parts, body) = finished.await.unwrap().into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Answer {
        status: parts.status,
        headers: parts.headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

async fn get(app: &App, uri: &str) -> Answer {
    run(app, http::Request::get(uri).body(Bytes::new()).unwrap()).await
}

fn single_app() -> App {
    App::new(ServerConfig {
        process_num: 0,
        ..ServerConfig::default()
    })
}

#[tokio::test]
async fn test_handler_shapes_are_indistinguishable() {
    let app = single_app();
    app.get(
        "/sync/:id",
        RouteHandler::from_fn(|ex| Ok(Reply::Json(json!({ "id": ex.context.get("id") })))),
    )
    .unwrap();
    app.get(
        "/async/:id",
        RouteHandler::from_async(|ex| async move {
            tokio::task::yield_now().await;
            Ok(Reply::Json(json!({ "id": ex.context.get("id") })))
        }),
    )
    .unwrap();
    app.get(
        "/steps/:id",
        RouteHandler::from_steps(|ex| {
            let id = ex.context.get("id");
            Steps::new(vec![
                step(async { Ok(Reply::from("discarded")) }),
                step(async move { Ok(Reply::Json(json!({ "id": id }))) }),
            ])
        }),
    )
    .unwrap();

    let mut answers = Vec::new();
    for shape in ["sync", "async", "steps"] {
        answers.push(get(&app, &format!("/{shape}/7")).await);
    }
    for answer in &answers {
        assert_eq!(answer.status, StatusCode::OK);
        assert_eq!(answer.headers["content-type"], "application/json");
        assert_eq!(answer.body, r#"{"id":"7"}"#);
    }
}

#[tokio::test]
async fn test_unmatched_request_gets_404() {
    let app = single_app();
    app.get("/known", RouteHandler::from_fn(|_| Ok(Reply::from("ok"))))
        .unwrap();
    let answer = get(&app, "/unknown").await;
    assert_eq!(answer.status, StatusCode::NOT_FOUND);
    assert_eq!(answer.body, NOT_FOUND_BODY);
}

#[tokio::test]
async fn test_method_filter() {
    let app = single_app();
    app.post("/thing", RouteHandler::from_fn(|_| Ok(Reply::from("posted"))))
        .unwrap();
    assert_eq!(get(&app, "/thing").await.status, StatusCode::NOT_FOUND);
    let answer = run(
        &app,
        http::Request::post("/thing").body(Bytes::new()).unwrap(),
    )
    .await;
    assert_eq!(answer.body, "posted");
}

#[tokio::test]
async fn test_route_params_and_query_reach_context() {
    let app = single_app();
    app.get(
        "/user/:id(/:tab)",
        RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))),
    )
    .unwrap();

    let body = get(&app, "/user/42?sort=asc").await.json();
    assert_eq!(body["id"], "42");
    assert_eq!(body["sort"], "asc");
    assert_eq!(body["_url_path"], "/user/42");
    assert_eq!(body["_skip404"], true);
    assert!(body.get("tab").is_none());

    let body = get(&app, "/user/42/posts").await.json();
    assert_eq!(body["tab"], "posts");
}

#[tokio::test]
async fn test_handler_error_is_500() {
    let app = single_app();
    app.get(
        "/fail",
        RouteHandler::from_fn(|_| Err(anyhow::anyhow!("broken pipe dream"))),
    )
    .unwrap();
    let answer = get(&app, "/fail").await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(answer.body, "500 Internal Server Error\n");
}

#[tokio::test]
async fn test_partial_output_is_discarded_on_error() {
    let app = single_app();
    app.get(
        "/half",
        RouteHandler::from_async(|ex| async move {
            ex.response.write("{\"partial\":");
            Err(anyhow::anyhow!("stream broke"))
        }),
    )
    .unwrap();
    let answer = get(&app, "/half").await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(answer.body, "500 Internal Server Error\n");
    assert_eq!(answer.headers["content-type"], "text/plain; charset=utf-8");
}

#[tokio::test]
async fn test_custom_hook_sees_empty_body() {
    let app = single_app();
    app.set_error_hook(|ex, _| {
        ex.response.set_status(StatusCode::BAD_GATEWAY);
        ex.response.write("upstream failed");
        ex.response.end();
    });
    app.get(
        "/half",
        RouteHandler::from_fn(|ex| {
            ex.response.write("leftover ");
            Err(anyhow::anyhow!("nope"))
        }),
    )
    .unwrap();
    let answer = get(&app, "/half").await;
    assert_eq!(answer.status, StatusCode::BAD_GATEWAY);
    assert_eq!(answer.body, "upstream failed");
}

#[tokio::test]
async fn test_debug_mode_includes_error() {
    let app = App::new(ServerConfig {
        process_num: 0,
        debug: true,
        ..ServerConfig::default()
    });
    app.get(
        "/panic",
        RouteHandler::from_fn(|_| {
            if true {
                panic!("kaboom");
            }
            Ok(Reply::Empty)
        }),
    )
    .unwrap();
    let answer = get(&app, "/panic").await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(answer.body.starts_with("500 Internal Server Error\n"));
    assert!(answer.body.contains("kaboom"), "{}", answer.body);
}

#[tokio::test]
async fn test_custom_error_hook() {
    let app = single_app();
    app.set_error_hook(|ex, err| {
        ex.response.send(
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain; charset=utf-8",
            format!("custom: {err}"),
        );
    });
    app.get(
        "/fail",
        RouteHandler::from_fn(|_| Err(anyhow::anyhow!("nope"))),
    )
    .unwrap();
    let answer = get(&app, "/fail").await;
    assert_eq!(answer.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(answer.body, "custom: nope");
}

#[tokio::test]
async fn test_middleware_runs_in_order_before_routes() {
    let app = single_app();
    app.add_middleware(
        None,
        RouteHandler::from_fn(|ex| {
            ex.context.insert("flag", true);
            ex.context.insert("order", json!(["first"]));
            Ok(Reply::Empty)
        }),
    );
    app.add_middleware(
        Some(Method::GET),
        RouteHandler::from_async(|ex| async move {
            let mut order = ex.context.get("order").unwrap_or(json!([]));
            if let Some(items) = order.as_array_mut() {
                items.push(json!("second"));
            }
            ex.context.insert("order", order);
            Ok(Reply::Empty)
        }),
    );
    app.add_middleware(
        Some(Method::POST),
        RouteHandler::from_fn(|ex| {
            ex.context.insert("posted", true);
            Ok(Reply::Empty)
        }),
    );
    app.get("/ctx", RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))))
        .unwrap();

    let body = get(&app, "/ctx").await.json();
    assert_eq!(body["flag"], true);
    assert_eq!(body["order"], json!(["first", "second"]));
    assert!(body.get("posted").is_none());
}

#[tokio::test]
async fn test_middleware_reply_short_circuits() {
    let app = single_app();
    let hits = Arc::new(AtomicUsize::new(0));
    app.add_middleware(
        None,
        RouteHandler::from_fn(|ex| {
            if ex.request.header("x-block").is_some() {
                return Ok(Reply::from("blocked"));
            }
            Ok(Reply::Empty)
        }),
    );
    let counter = Arc::clone(&hits);
    app.get(
        "/",
        RouteHandler::from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Reply::from("route"))
        }),
    )
    .unwrap();

    let blocked = run(
        &app,
        http::Request::get("/")
            .header("x-block", "1")
            .body(Bytes::new())
            .unwrap(),
    )
    .await;
    assert_eq!(blocked.body, "blocked");
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert_eq!(get(&app, "/").await.body, "route");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_middleware_registration_is_idempotent() {
    let app = single_app();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let middleware = app.add_middleware(
        None,
        RouteHandler::from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Reply::Empty)
        }),
    );
    assert!(!app.use_middleware(&middleware));
    assert_eq!(app.dispatcher().middlewares().len(), 1);

    get(&app, "/").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(app.remove_middleware(&middleware), 1);
    assert_eq!(app.remove_middleware(&middleware), 0);
    get(&app, "/").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_route_removal() {
    let app = single_app();
    let route = app
        .get("/gone", RouteHandler::from_fn(|_| Ok(Reply::from("here"))))
        .unwrap();
    assert_eq!(get(&app, "/gone").await.status, StatusCode::OK);
    assert_eq!(app.remove_route(&route), 1);
    assert_eq!(get(&app, "/gone").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_first_matching_route_wins() {
    let app = single_app();
    app.get("/a/:x", RouteHandler::from_fn(|_| Ok(Reply::from("param"))))
        .unwrap();
    app.get("/a/literal", RouteHandler::from_fn(|_| Ok(Reply::from("literal"))))
        .unwrap();
    assert_eq!(get(&app, "/a/literal").await.body, "param");
}

#[tokio::test]
async fn test_route_without_reply_ends_pipeline_with_empty_200() {
    let app = single_app();
    app.get("/quiet", RouteHandler::from_fn(|_| Ok(Reply::Empty)))
        .unwrap();
    let (response, finished) = Response::channel();
    let exchange = app.dispatcher().exchange(
        Request::new(http::Request::get("/quiet").body(Bytes::new()).unwrap(), None),
        response,
    );
    assert!(app.dispatcher().dispatch(&exchange).await);
    // Claimed but not finished: the handler owns the response.
    assert!(!exchange.response.is_finished());
    exchange.response.write("late");
    exchange.response.end();
    let (_, body) = finished.await.unwrap().into_parts();
    assert_eq!(body.collect().await.unwrap().to_bytes(), "late");
}

#[tokio::test]
async fn test_form_fields_are_decoded_into_context() {
    let app = single_app();
    app.post("/form", RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))))
        .unwrap();

    let urlencoded = run(
        &app,
        http::Request::post("/form")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"name=ada&lang=rust&lang=c"))
            .unwrap(),
    )
    .await
    .json();
    assert_eq!(urlencoded["name"], "ada");
    assert_eq!(urlencoded["lang"], json!(["rust", "c"]));

    let json_body = run(
        &app,
        http::Request::post("/form")
            .header("content-type", "application/json")
            .body(Bytes::from_static(br#"{"n":3}"#))
            .unwrap(),
    )
    .await
    .json();
    assert_eq!(json_body["n"], 3);
}

#[tokio::test]
async fn test_malformed_body_is_500() {
    let app = single_app();
    app.post("/form", RouteHandler::from_fn(|_| Ok(Reply::from("unreachable"))))
        .unwrap();
    let answer = run(
        &app,
        http::Request::post("/form")
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_form_parsing_can_be_disabled() {
    let app = App::new(ServerConfig {
        process_num: 0,
        enable_form_parsing: false,
        ..ServerConfig::default()
    });
    app.post("/form", RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))))
        .unwrap();
    let body = run(
        &app,
        http::Request::post("/form")
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{not json"))
            .unwrap(),
    )
    .await
    .json();
    assert!(body.get("body").is_none());
}

#[tokio::test]
async fn test_serve_limit_stops_worker() {
    let app = App::new(ServerConfig {
        process_num: 2,
        worker_serve_times_to_restart: 2,
        ..ServerConfig::default()
    });
    app.lifecycle().set_role(Role::Worker { id: 1 });
    app.get("/", RouteHandler::from_fn(|_| Ok(Reply::from("ok"))))
        .unwrap();

    get(&app, "/").await;
    assert!(!app.lifecycle().is_stopping());
    get(&app, "/").await;
    assert_eq!(
        app.lifecycle().reason(),
        Some(ExitReason::ServeLimitReached { served: 2 })
    );
}

#[tokio::test]
async fn test_serve_limit_ignored_outside_workers() {
    let app = App::new(ServerConfig {
        process_num: 0,
        worker_serve_times_to_restart: 1,
        ..ServerConfig::default()
    });
    app.get("/", RouteHandler::from_fn(|_| Ok(Reply::from("ok"))))
        .unwrap();
    get(&app, "/").await;
    get(&app, "/").await;
    assert!(!app.lifecycle().is_stopping());
    assert_eq!(app.lifecycle().served(), 2);
}
