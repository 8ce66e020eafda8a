//! Handler wrapping.
//!
//! # Responsibilities
//! - Run a business handler inside a request span
//! - Contain handler errors, panics and timeouts as a generic 500
//! - Record the request counter and latency histogram
//! - Emit exactly one request log line
//!
//! # Design Decisions
//! - The span closes before metrics and the log line are written
//! - Metrics are recorded before the log line
//! - Every instrumentation step fails on its own: a broken log sink does
//!   not lose metrics, and nothing here fails the response

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;

use crate::instrumentation::context::{RequestContext, Stage};
use crate::instrumentation::request::{Reply, Request};
use crate::instrumentation::telemetry::Telemetry;
use crate::observability::logging::LogRecord;
use crate::observability::metrics::{MetricsError, REQUESTS_TOTAL, REQUEST_LATENCY_SECONDS};
use crate::observability::report::FailureReporter;
use crate::observability::tracing::{Span, SpanStatus};

/// Body sent when a request fails inside the service.
pub const INTERNAL_ERROR_BODY: &str = "Internal Server Error\n";

/// Failure raised by (or on behalf of) a wrapped handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Reply, HandlerError>>;

/// A business handler. The span is the open request span, for attributes.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, span: Span) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Span) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
{
    fn call(&self, request: Request, span: Span) -> HandlerFuture {
        Box::pin(self(request, span))
    }
}

/// Static description of an instrumented route.
#[derive(Debug, Clone)]
pub struct Route {
    /// Span name, e.g. `hello-handler`.
    pub handler_name: String,
    /// `path` label for metrics and logs, e.g. `/hello`.
    pub path_label: String,
    pub timeout: Option<Duration>,
}

impl Route {
    pub fn new(handler_name: impl Into<String>, path_label: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.into(),
            path_label: path_label.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A handler wrapped with tracing, metrics and request logging.
#[derive(Clone)]
pub struct InstrumentedHandler {
    telemetry: Telemetry,
    route: Arc<Route>,
    handler: Arc<dyn Handler>,
    log_failures: Arc<FailureReporter>,
}

impl InstrumentedHandler {
    pub fn new(telemetry: Telemetry, route: Route, handler: impl Handler) -> Self {
        Self {
            telemetry,
            route: Arc::new(route),
            handler: Arc::new(handler),
            log_failures: Arc::new(FailureReporter::new("request log write")),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Handle one request. Never fails: internal errors become a 500.
    pub async fn call(&self, request: Request) -> Reply {
        let telemetry = &self.telemetry;
        let mut ctx = RequestContext::start(&telemetry.tracer, &self.route.handler_name);

        let method = request.method.as_str().to_string();
        let client_ip = request
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let request_id = request.request_id.clone();

        ctx.advance(Stage::HandlerRunning);
        let mut error: Option<String> = None;
        let mut reply = match self.run_handler(request, ctx.span().clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(
                    handler = %self.route.handler_name,
                    error = %e,
                    "Request handler failed"
                );
                ctx.span().set_status(SpanStatus::error(e.to_string()));
                error = Some(e.to_string());
                Reply::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY)
            }
        };
        ctx.close_span();

        let duration = ctx.elapsed();
        let path = self.route.path_label.as_str();
        let latency_labels = [path, method.as_str()];

        // Settle the status before counting so the counter, the response
        // and the log line agree on it.
        let latency_ready = match telemetry
            .metrics
            .check_histogram(REQUEST_LATENCY_SECONDS, &latency_labels)
        {
            Ok(()) => true,
            Err(e) => {
                self.metrics_failed(&mut reply, &mut error, e);
                false
            }
        };
        let status = reply.status.as_u16().to_string();
        if let Err(e) = telemetry
            .metrics
            .increment(REQUESTS_TOTAL, &[path, method.as_str(), status.as_str()])
        {
            self.metrics_failed(&mut reply, &mut error, e);
        }
        if latency_ready {
            if let Err(e) = telemetry.metrics.observe(
                REQUEST_LATENCY_SECONDS,
                &latency_labels,
                duration.as_secs_f64(),
            ) {
                self.metrics_failed(&mut reply, &mut error, e);
            }
        }
        ctx.advance(Stage::MetricsRecorded);

        let mut record = LogRecord::new()
            .field("event", "request")
            .field("path", path)
            .field("method", &method)
            .field("status", reply.status.as_u16());
        if let Some(error) = &error {
            record.push("error", error);
        }
        record.extend(std::mem::take(&mut reply.log_fields));
        record.push("duration_ms", format_duration_ms(duration));
        record.push("client_ip", client_ip);
        if let Some(id) = request_id {
            record.push("request_id", id);
        }
        if let Err(e) = telemetry.logger.log(&record) {
            self.log_failures.report(&e);
        }
        ctx.advance(Stage::Logged);

        ctx.advance(Stage::Done);
        reply
    }

    fn metrics_failed(&self, reply: &mut Reply, error: &mut Option<String>, e: MetricsError) {
        tracing::error!(handler = %self.route.handler_name, error = %e, "Failed to record request metrics");
        *reply = Reply::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY);
        error.get_or_insert_with(|| e.to_string());
    }

    async fn run_handler(&self, request: Request, span: Span) -> Result<Reply, HandlerError> {
        let handler = self.handler.clone();
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(request, span))) {
            Ok(future) => future,
            Err(panic) => return Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };
        let guarded = AssertUnwindSafe(future).catch_unwind();

        let outcome = match self.route.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(HandlerError::TimedOut(limit)),
            },
            None => guarded.await,
        };
        outcome.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))))
    }
}

/// Milliseconds rounded to one decimal place.
fn format_duration_ms(duration: Duration) -> String {
    format!("{:.1}", duration.as_secs_f64() * 1000.0)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::export::{InMemoryExporter, SimpleSpanProcessor};
    use crate::observability::logging::{LogSink, MemorySink, StructuredLogger};
    use crate::observability::metrics::MetricsRegistry;
    use crate::observability::tracing::Tracer;
    use axum::http::Method;
    use std::io;

    struct Harness {
        telemetry: Telemetry,
        spans: InMemoryExporter,
        lines: MemorySink,
    }

    fn harness() -> Harness {
        let spans = InMemoryExporter::default();
        let lines = MemorySink::default();
        let tracer = Tracer::new("test", Arc::new(SimpleSpanProcessor::new(Box::new(spans.clone()))));
        let telemetry = Telemetry::new(
            Arc::new(MetricsRegistry::new()),
            tracer,
            StructuredLogger::new(Arc::new(lines.clone())),
        )
        .unwrap();
        Harness { telemetry, spans, lines }
    }

    fn get(path: &str) -> Request {
        Request::new(Method::GET, path).with_client_ip("10.0.0.7".parse().unwrap())
    }

    #[test]
    fn duration_is_rounded_to_one_decimal() {
        assert_eq!(format_duration_ms(Duration::from_micros(30_449)), "30.4");
        assert_eq!(format_duration_ms(Duration::ZERO), "0.0");
    }

    #[tokio::test]
    async fn successful_request_is_traced_counted_and_logged() {
        let h = harness();
        let handler = h.telemetry.instrument(
            Route::new("hello-handler", "/hello"),
            |req: Request, span: Span| async move {
                let name = req.param("name").unwrap_or_default().to_string();
                span.set_attribute("app.user_name", name.clone());
                Ok::<_, HandlerError>(Reply::ok(format!("Hello {name}!\n")).with_log_field("name", name))
            },
        );

        let reply = handler
            .call(get("/hello/world").with_param("name", "world").with_request_id("abc"))
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, "Hello world!\n");
        assert!(reply.log_fields.is_empty());

        let metrics = &h.telemetry.metrics;
        assert_eq!(metrics.counter_value(REQUESTS_TOTAL, &["/hello", "GET", "200"]), Some(1));
        let hist = metrics
            .histogram_snapshot(REQUEST_LATENCY_SECONDS, &["/hello", "GET"])
            .unwrap();
        assert_eq!(hist.count, 1);

        let spans = h.spans.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "hello-handler");
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(
            spans[0].attribute("app.user_name"),
            Some(&crate::observability::AttributeValue::from("world"))
        );

        let lines = h.lines.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("event=request path=/hello method=GET status=200 name=world duration_ms="));
        assert!(lines[0].ends_with(" client_ip=10.0.0.7 request_id=abc"));
    }

    #[tokio::test]
    async fn failing_handler_becomes_500() {
        let h = harness();
        let handler = h.telemetry.instrument(
            Route::new("broken-handler", "/broken"),
            |_req: Request, _span: Span| async move { Err::<Reply, _>(HandlerError::msg("database down")) },
        );

        let reply = handler.call(get("/broken")).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.body, INTERNAL_ERROR_BODY);

        let metrics = &h.telemetry.metrics;
        assert_eq!(metrics.counter_value(REQUESTS_TOTAL, &["/broken", "GET", "500"]), Some(1));
        assert_eq!(
            metrics
                .histogram_snapshot(REQUEST_LATENCY_SECONDS, &["/broken", "GET"])
                .unwrap()
                .count,
            1
        );
        let spans = h.spans.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].status.is_error());

        let lines = h.lines.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("event=request path=/broken method=GET status=500 error=database_down"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let h = harness();
        let handler = h.telemetry.instrument(
            Route::new("panicky-handler", "/panic"),
            |_req: Request, _span: Span| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, HandlerError>(Reply::ok("unreachable"))
            },
        );

        let reply = handler.call(get("/panic")).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.spans.spans().len(), 1);
        assert_eq!(
            h.telemetry.metrics.counter_value(REQUESTS_TOTAL, &["/panic", "GET", "500"]),
            Some(1)
        );
        assert!(h.lines.lines()[0].contains("error=handler_panicked:_boom"));
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_still_closes_span() {
        let h = harness();
        let handler = h.telemetry.instrument(
            Route::new("slow-handler", "/slow").with_timeout(Duration::from_millis(10)),
            |_req: Request, _span: Span| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(Reply::ok("late"))
            },
        );

        let reply = handler.call(get("/slow")).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        let spans = h.spans.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].status.is_error());
        assert!(spans[0].end_time >= spans[0].start_time);
    }

    #[tokio::test]
    async fn log_sink_failure_keeps_metrics_and_response() {
        struct BrokenSink;
        impl LogSink for BrokenSink {
            fn write_line(&self, _line: &str) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
        }

        let h = harness();
        let telemetry = Telemetry {
            logger: StructuredLogger::new(Arc::new(BrokenSink)),
            ..h.telemetry.clone()
        };
        let handler = telemetry.instrument(Route::new("index-handler", "/"), |_req: Request, _span: Span| async {
            Ok::<_, HandlerError>(Reply::ok("Hello from sample app!\n"))
        });

        let reply = handler.call(get("/")).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(
            telemetry.metrics.counter_value(REQUESTS_TOTAL, &["/", "GET", "200"]),
            Some(1)
        );
    }

    #[tokio::test]
    async fn slow_log_sink_does_not_delay_response() {
        struct SlowSink(MemorySink);
        impl LogSink for SlowSink {
            fn write_line(&self, line: &str) -> io::Result<()> {
                std::thread::sleep(Duration::from_millis(400));
                self.0.write_line(line)
            }
        }

        let h = harness();
        let (logger, writer) = StructuredLogger::spawn(Arc::new(SlowSink(h.lines.clone())), 16).unwrap();
        let telemetry = Telemetry {
            logger,
            ..h.telemetry.clone()
        };
        let handler = telemetry.instrument(Route::new("index-handler", "/"), |_req: Request, _span: Span| async {
            Ok::<_, HandlerError>(Reply::ok("Hello from sample app!\n"))
        });

        let started = std::time::Instant::now();
        let reply = handler.call(get("/")).await;
        let elapsed = started.elapsed();
        assert_eq!(reply.status, StatusCode::OK);
        assert!(
            elapsed < Duration::from_millis(200),
            "response waited {elapsed:?} on the log sink"
        );

        writer.shutdown().await.unwrap();
        let lines = h.lines.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("event=request path=/ method=GET status=200"));
    }

    #[tokio::test]
    async fn metrics_misuse_is_converted_to_500() {
        let h = harness();
        let telemetry = Telemetry {
            metrics: Arc::new(MetricsRegistry::new()),
            ..h.telemetry.clone()
        };
        let handler = telemetry.instrument(Route::new("index-handler", "/"), |_req: Request, _span: Span| async {
            Ok::<_, HandlerError>(Reply::ok("Hello from sample app!\n"))
        });

        let reply = handler.call(get("/")).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        let lines = h.lines.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("status=500 error=unknown_metric_series_app_request_latency_seconds"));
    }

    #[tokio::test]
    async fn counter_records_status_of_failed_latency_series() {
        let h = harness();
        let metrics = Arc::new(MetricsRegistry::new());
        metrics
            .register_counter(REQUESTS_TOTAL, "Total HTTP requests", &crate::observability::metrics::REQUEST_LABELS)
            .unwrap();
        metrics
            .register_histogram(REQUEST_LATENCY_SECONDS, "Latency", &["path"], &[0.1])
            .unwrap();
        let telemetry = Telemetry {
            metrics: metrics.clone(),
            ..h.telemetry.clone()
        };
        let handler = telemetry.instrument(Route::new("index-handler", "/"), |_req: Request, _span: Span| async {
            Ok::<_, HandlerError>(Reply::ok("Hello from sample app!\n"))
        });

        let reply = handler.call(get("/")).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(metrics.counter_value(REQUESTS_TOTAL, &["/", "GET", "200"]), None);
        assert_eq!(metrics.counter_value(REQUESTS_TOTAL, &["/", "GET", "500"]), Some(1));
        assert!(h.lines.lines()[0].starts_with("event=request path=/ method=GET status=500 error="));
    }

    #[tokio::test]
    async fn span_is_exported_and_metrics_committed_before_log_line() {
        struct CheckingSink {
            metrics: Arc<MetricsRegistry>,
            spans: InMemoryExporter,
            seen: MemorySink,
        }
        impl LogSink for CheckingSink {
            fn write_line(&self, line: &str) -> io::Result<()> {
                let counted = self.metrics.counter_value(REQUESTS_TOTAL, &["/", "GET", "200"]);
                let exported = self.spans.spans().len();
                self.seen
                    .write_line(&format!("{line} counted={counted:?} exported={exported}"))
            }
        }

        let h = harness();
        let sink = CheckingSink {
            metrics: h.telemetry.metrics.clone(),
            spans: h.spans.clone(),
            seen: h.lines.clone(),
        };
        let telemetry = Telemetry {
            logger: StructuredLogger::new(Arc::new(sink)),
            ..h.telemetry.clone()
        };
        let handler = telemetry.instrument(Route::new("index-handler", "/"), |_req: Request, _span: Span| async {
            Ok::<_, HandlerError>(Reply::ok("Hello from sample app!\n"))
        });
        handler.call(get("/")).await;

        let line = &h.lines.lines()[0];
        assert!(line.ends_with("counted=Some(1) exported=1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_lose_no_updates() {
        let h = harness();
        let handler = h.telemetry.instrument(
            Route::new("hello-handler", "/hello"),
            |req: Request, _span: Span| async move {
                if req.param("name") == Some("fail") {
                    return Err(HandlerError::msg("nope"));
                }
                tokio::task::yield_now().await;
                Ok(Reply::ok("hi"))
            },
        );

        let mut tasks = Vec::new();
        for i in 0..200 {
            let handler = handler.clone();
            let name = if i % 4 == 0 { "fail" } else { "ok" };
            tasks.push(tokio::spawn(async move {
                handler.call(get("/hello/x").with_param("name", name)).await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let metrics = &h.telemetry.metrics;
        let ok = metrics.counter_value(REQUESTS_TOTAL, &["/hello", "GET", "200"]).unwrap();
        let failed = metrics.counter_value(REQUESTS_TOTAL, &["/hello", "GET", "500"]).unwrap();
        assert_eq!(ok, 150);
        assert_eq!(failed, 50);
        let hist = metrics
            .histogram_snapshot(REQUEST_LATENCY_SECONDS, &["/hello", "GET"])
            .unwrap();
        assert_eq!(hist.count, ok + failed);
        assert!(hist.sum >= 0.0);
        assert_eq!(h.spans.spans().len(), 200);
        assert_eq!(h.lines.lines().len(), 200);
    }
}
