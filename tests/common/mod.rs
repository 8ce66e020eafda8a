//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceExt;

use sample_app::config::HandlerConfig;
use sample_app::observability::{InMemoryExporter, MemorySink, MetricsRegistry, SimpleSpanProcessor, StructuredLogger, Tracer};
use sample_app::{HttpServer, Shutdown, Telemetry};

/// A service wired to in-memory span and log collectors.
pub struct TestApp {
    pub telemetry: Telemetry,
    pub spans: InMemoryExporter,
    pub lines: MemorySink,
}

impl TestApp {
    pub fn new() -> Self {
        let spans = InMemoryExporter::default();
        let lines = MemorySink::default();
        let tracer = Tracer::new(
            "sample-app",
            Arc::new(SimpleSpanProcessor::new(Box::new(spans.clone()))),
        );
        let telemetry = Telemetry::new(
            Arc::new(MetricsRegistry::new()),
            tracer,
            StructuredLogger::new(Arc::new(lines.clone())),
        )
        .unwrap();
        Self {
            telemetry,
            spans,
            lines,
        }
    }

    pub fn server(&self) -> HttpServer {
        HttpServer::new(&self.telemetry, &handler_config())
    }

    pub fn router(&self) -> Router {
        self.server().router()
    }

    /// Issue a GET through the router without a socket.
    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, String) {
        let response = self
            .router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    /// Serve on an ephemeral local port until `shutdown` is triggered.
    pub async fn spawn(&self, shutdown: &Shutdown) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = self.server();
        let signalled = shutdown.signalled();
        tokio::spawn(async move {
            let _ = server.run(listener, signalled).await;
        });
        addr
    }
}

/// No simulated work, so tests run fast.
pub fn handler_config() -> HandlerConfig {
    HandlerConfig {
        index_work_ms: 0,
        hello_work_ms: 0,
        timeout_secs: 5,
    }
}
