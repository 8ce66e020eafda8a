//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the span processor for the configured exporter
//! - Create the metrics registry, tracer and request logger
//! - Declare the request metrics before any traffic arrives
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The span processor and log writer are returned separately so they can
//!   be drained on exit
//! - Must run inside the tokio runtime: both background writers are tasks

use std::sync::Arc;

use thiserror::Error;

use crate::config::{AppConfig, ExporterKind};
use crate::instrumentation::Telemetry;
use crate::observability::export::{
    BatchConfig, BatchSpanProcessor, ExportError, LogExporter, NoopSpanProcessor, SpanExporter,
    SpanProcessor, UdpJsonExporter,
};
use crate::observability::logging::{LogError, LogSink, LogWriter, StructuredLogger};
use crate::observability::metrics::{MetricsError, MetricsRegistry};
use crate::observability::tracing::Tracer;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("metrics setup failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("span exporter setup failed: {0}")]
    Export(#[from] ExportError),

    #[error("request log setup failed: {0}")]
    Log(#[from] LogError),
}

/// Everything the server needs, plus the background writers to drain at exit.
pub struct Components {
    pub telemetry: Telemetry,
    pub span_processor: Arc<dyn SpanProcessor>,
    pub log_writer: Option<LogWriter>,
}

impl Components {
    /// Flush queued spans and request log lines, then stop both writers.
    pub async fn shutdown(self) {
        match self.span_processor.shutdown().await {
            Ok(()) => tracing::info!("Span processor flushed"),
            Err(e) => tracing::warn!(error = %e, "Span processor shutdown failed"),
        }
        if let Some(writer) = self.log_writer {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(error = %e, "Request log writer shutdown failed");
            }
        }
    }
}

/// Build observability components with request logs queued for stdout.
pub fn build(config: &AppConfig) -> Result<Components, StartupError> {
    let (logger, writer) = StructuredLogger::stdout(config.observability.log_queue_size)?;
    assemble(config, logger, Some(writer))
}

/// Build observability components writing request logs inline to `sink`.
pub fn build_with_sink(config: &AppConfig, sink: Arc<dyn LogSink>) -> Result<Components, StartupError> {
    assemble(config, StructuredLogger::new(sink), None)
}

fn assemble(
    config: &AppConfig,
    logger: StructuredLogger,
    log_writer: Option<LogWriter>,
) -> Result<Components, StartupError> {
    let span_processor = span_processor(config)?;
    let tracer = Tracer::new(config.service.name.clone(), span_processor.clone());
    let telemetry = Telemetry::with_buckets(
        Arc::new(MetricsRegistry::new()),
        tracer,
        logger,
        &config.metrics.latency_buckets,
    )?;

    tracing::info!(
        service = %config.service.name,
        exporter = ?config.tracing.exporter,
        agent = %format!("{}:{}", config.tracing.agent_host, config.tracing.agent_port),
        "Telemetry initialized"
    );

    Ok(Components {
        telemetry,
        span_processor,
        log_writer,
    })
}

fn span_processor(config: &AppConfig) -> Result<Arc<dyn SpanProcessor>, StartupError> {
    let exporter: Box<dyn SpanExporter> = match config.tracing.exporter {
        ExporterKind::Udp => Box::new(UdpJsonExporter::new(
            config.service.name.clone(),
            &config.tracing.agent_host,
            config.tracing.agent_port,
        )?),
        ExporterKind::Log => Box::new(LogExporter),
        ExporterKind::None => return Ok(Arc::new(NoopSpanProcessor)),
    };
    let processor = BatchSpanProcessor::new(exporter, BatchConfig::from(&config.tracing))?;
    Ok(Arc::new(processor))
}
