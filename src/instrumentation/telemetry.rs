//! The metrics registry, tracer and request logger, bundled for injection.

use std::sync::Arc;

use crate::instrumentation::handler::{Handler, InstrumentedHandler, Route};
use crate::observability::logging::StructuredLogger;
use crate::observability::metrics::{
    MetricsError, MetricsRegistry, DEFAULT_LATENCY_BUCKETS, LATENCY_LABELS, REQUESTS_TOTAL,
    REQUEST_LABELS, REQUEST_LATENCY_SECONDS,
};
use crate::observability::tracing::Tracer;

/// Shared observability components handed to every instrumented route.
#[derive(Clone)]
pub struct Telemetry {
    pub metrics: Arc<MetricsRegistry>,
    pub tracer: Tracer,
    pub logger: StructuredLogger,
}

impl Telemetry {
    /// Bundle the components and declare the request metrics with the
    /// default latency buckets.
    pub fn new(
        metrics: Arc<MetricsRegistry>,
        tracer: Tracer,
        logger: StructuredLogger,
    ) -> Result<Self, MetricsError> {
        Self::with_buckets(metrics, tracer, logger, &DEFAULT_LATENCY_BUCKETS)
    }

    pub fn with_buckets(
        metrics: Arc<MetricsRegistry>,
        tracer: Tracer,
        logger: StructuredLogger,
        latency_buckets: &[f64],
    ) -> Result<Self, MetricsError> {
        metrics.register_counter(REQUESTS_TOTAL, "Total HTTP requests", &REQUEST_LABELS)?;
        metrics.register_histogram(
            REQUEST_LATENCY_SECONDS,
            "Request latency in seconds",
            &LATENCY_LABELS,
            latency_buckets,
        )?;
        Ok(Self {
            metrics,
            tracer,
            logger,
        })
    }

    /// Wrap `handler` so every call is traced, counted, timed and logged.
    pub fn instrument(&self, route: Route, handler: impl Handler) -> InstrumentedHandler {
        InstrumentedHandler::new(self.clone(), route, handler)
    }
}
