//! Route-level behaviour of the instrumented service.

use axum::http::{header, StatusCode};
use sample_app::observability::metrics::{REQUESTS_TOTAL, REQUEST_LATENCY_SECONDS};

mod common;

use common::TestApp;

#[tokio::test]
async fn hello_route_greets_counts_and_logs() {
    let app = TestApp::new();

    let (status, headers, body) = app.get("/hello/world").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello world!\n");
    assert!(headers.contains_key("x-request-id"));

    let metrics = &app.telemetry.metrics;
    assert_eq!(metrics.counter_value(REQUESTS_TOTAL, &["/hello", "GET", "200"]), Some(1));

    let lines = app.lines.lines();
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].contains("event=request path=/hello method=GET status=200 name=world"),
        "unexpected log line: {}",
        lines[0]
    );
    let request_id = headers["x-request-id"].to_str().unwrap();
    assert!(lines[0].contains(&format!("request_id={request_id}")));

    let spans = app.spans.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "hello-handler");
    assert!(spans[0].end_time >= spans[0].start_time);
}

#[tokio::test]
async fn index_route_uses_root_path_label() {
    let app = TestApp::new();

    let (status, _, body) = app.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello from sample app!\n");
    assert_eq!(
        app.telemetry
            .metrics
            .counter_value(REQUESTS_TOTAL, &["/", "GET", "200"]),
        Some(1)
    );
    let lines = app.lines.lines();
    assert!(lines[0].starts_with("event=request path=/ method=GET status=200 user_agent="));
    assert_eq!(app.spans.spans()[0].name, "index-handler");
}

#[tokio::test]
async fn healthz_is_not_instrumented() {
    let app = TestApp::new();

    let (status, _, body) = app.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok\n");

    assert!(app.lines.lines().is_empty());
    assert!(app.spans.spans().is_empty());
    assert!(!app.telemetry.metrics.export().contains("app_requests_total{"));
}

#[tokio::test]
async fn metrics_route_exposes_counters() {
    let app = TestApp::new();
    app.get("/hello/world").await;
    app.get("/hello/rust").await;
    app.get("/").await;

    let (status, headers, body) = app.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "text/plain; version=0.0.4; charset=utf-8"
    );
    assert!(body.contains("app_requests_total{path=\"/hello\",method=\"GET\",status=\"200\"} 2\n"));
    assert!(body.contains("app_requests_total{path=\"/\",method=\"GET\",status=\"200\"} 1\n"));
    assert!(body.contains("app_request_latency_seconds_count{path=\"/hello\",method=\"GET\"} 2\n"));

    // Scraping is not itself counted.
    assert_eq!(app.lines.lines().len(), 3);
}

#[tokio::test]
async fn repeated_scrapes_are_identical() {
    let app = TestApp::new();
    app.get("/hello/world").await;

    let (_, _, first) = app.get("/metrics").await;
    let (_, _, second) = app.get("/metrics").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn histogram_count_matches_counter_total() {
    let app = TestApp::new();
    for name in ["a", "b", "c", "d"] {
        app.get(&format!("/hello/{name}")).await;
    }

    let metrics = &app.telemetry.metrics;
    let counted = metrics
        .counter_value(REQUESTS_TOTAL, &["/hello", "GET", "200"])
        .unwrap();
    let snapshot = metrics
        .histogram_snapshot(REQUEST_LATENCY_SECONDS, &["/hello", "GET"])
        .unwrap();
    assert_eq!(snapshot.count, counted);
    assert!(snapshot.sum >= 0.0);
}

#[tokio::test]
async fn unknown_route_is_404_and_uncounted() {
    let app = TestApp::new();
    let (status, _, _) = app.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.lines.lines().is_empty());
}
