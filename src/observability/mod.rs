//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Instrumented handlers produce:
//!     → metrics.rs (counters, histograms)
//!     → tracing.rs (spans with trace/span ids)
//!     → logging.rs (one logfmt line per request)
//!
//! Consumers:
//!     → Metrics endpoint (Prometheus scrape of MetricsRegistry::export)
//!     → export.rs (span processors → collector agent over UDP)
//!     → Log shipper reading stdout
//! ```
//!
//! # Design Decisions
//! - Every component is an owned value injected where it is used
//! - Metrics are cheap (atomic increments, one mutex per histogram series)
//! - Nothing on the request path waits for export or sink I/O to finish

pub mod export;
pub mod logging;
pub mod metrics;
pub mod report;
pub mod tracing;

pub use self::export::{
    BatchConfig, BatchSpanProcessor, ExportError, InMemoryExporter, LogExporter,
    NoopSpanProcessor, SimpleSpanProcessor, SpanExporter, SpanProcessor, UdpJsonExporter,
};
pub use self::logging::{
    LogError, LogRecord, LogSink, LogWriter, MemorySink, StdoutSink, StructuredLogger,
};
pub use self::metrics::{MetricsError, MetricsRegistry};
pub use self::tracing::{AttributeValue, Span, SpanData, SpanGuard, SpanStatus, Tracer};
