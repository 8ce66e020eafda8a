//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wrap greeting routes with request instrumentation
//! - Wire up middleware (request ID, access tracing)
//! - Serve the metrics exposition and the liveness probe
//! - Bind server to listener and drain on shutdown

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Request, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::HandlerConfig;
use crate::http::{handlers, request::from_http};
use crate::instrumentation::{InstrumentedHandler, Route, Telemetry};
use crate::observability::metrics::{MetricsRegistry, EXPOSITION_CONTENT_TYPE};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub index: InstrumentedHandler,
    pub hello: InstrumentedHandler,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    pub fn new(telemetry: &Telemetry, config: &HandlerConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let index = telemetry.instrument(
            Route::new("index-handler", "/").with_timeout(timeout),
            handlers::index(Duration::from_millis(config.index_work_ms)),
        );
        let hello = telemetry.instrument(
            Route::new("hello-handler", "/hello").with_timeout(timeout),
            handlers::hello(Duration::from_millis(config.hello_work_ms)),
        );
        Self {
            index,
            hello,
            metrics: telemetry.metrics.clone(),
        }
    }
}

/// HTTP server for the service.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(telemetry: &Telemetry, config: &HandlerConfig) -> Self {
        Self {
            router: build_router(AppState::new(telemetry, config)),
        }
    }

    /// The fully layered router, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` resolves, then drain.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("HTTP server draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/hello/{name}", get(hello))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn index(State(state): State<AppState>, request: Request) -> Response {
    let request = from_http(&request, BTreeMap::new());
    state.index.call(request).await.into_response()
}

async fn hello(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let params = BTreeMap::from([("name".to_string(), name)]);
    let request = from_http(&request, params);
    state.hello.call(request).await.into_response()
}

/// Liveness probe, not instrumented.
async fn healthz() -> &'static str {
    handlers::HEALTHZ_BODY
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        state.metrics.export(),
    )
}
