//! Span processing and export.
//!
//! # Data Flow
//! ```text
//! Tracer::end_span
//!     → SpanProcessor::on_end (never waits on I/O)
//!         Simple: export as a batch of one, inline when it completes
//!                 without waiting, otherwise on a spawned task
//!         Batch:  bounded queue → worker task → export in batches
//!     → SpanExporter::export (UDP collector, log, in-memory)
//! ```
//!
//! # Design Decisions
//! - A full queue drops the span instead of blocking the request path
//! - Export failures are reported through a rate-limited reporter, never retried

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::time::{self, MissedTickBehavior};

use crate::config::TracingConfig;
use crate::observability::report::FailureReporter;
use crate::observability::tracing::SpanData;

/// Largest payload sent in a single datagram.
const MAX_DATAGRAM_BYTES: usize = 65_000;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode spans: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not resolve collector address {0}")]
    Resolve(String),

    #[error("span {0} exceeds the maximum datagram size")]
    Oversized(String),

    #[error("span queue is full")]
    QueueFull,

    #[error("span processor has shut down")]
    Closed,

    #[error("a tokio runtime is required to export spans")]
    NoRuntime,
}

/// Destination for completed spans. Batching cadence belongs to the caller.
#[async_trait]
pub trait SpanExporter: Send + Sync + 'static {
    async fn export(&self, batch: &[SpanData]) -> Result<(), ExportError>;
}

/// Receives every span as it ends.
#[async_trait]
pub trait SpanProcessor: Send + Sync {
    /// Called once per completed span. Must not wait on export I/O.
    fn on_end(&self, span: SpanData);

    async fn force_flush(&self) -> Result<(), ExportError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Exports each span on its own.
pub struct SimpleSpanProcessor {
    exporter: Arc<dyn SpanExporter>,
    reporter: Arc<FailureReporter>,
}

impl SimpleSpanProcessor {
    pub fn new(exporter: Box<dyn SpanExporter>) -> Self {
        Self {
            exporter: Arc::from(exporter),
            reporter: Arc::new(FailureReporter::new("span export")),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_end(&self, span: SpanData) {
        let exporter = Arc::clone(&self.exporter);
        let reporter = Arc::clone(&self.reporter);
        let mut export = Box::pin(async move {
            if let Err(e) = exporter.export(std::slice::from_ref(&span)).await {
                reporter.report(&e);
            }
        });
        // In-memory and log exporters finish on the first poll.
        if (&mut export).now_or_never().is_some() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(export);
            }
            Err(_) => {
                self.reporter.report(&ExportError::NoRuntime);
            }
        }
    }
}

/// Discards every span.
#[derive(Debug, Default)]
pub struct NoopSpanProcessor;

impl SpanProcessor for NoopSpanProcessor {
    fn on_end(&self, _span: SpanData) {}
}

/// Tuning for [`BatchSpanProcessor`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_queue_size: usize,
    pub max_batch_size: usize,
    pub scheduled_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
        }
    }
}

impl From<&TracingConfig> for BatchConfig {
    fn from(config: &TracingConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            max_batch_size: config.max_batch_size,
            scheduled_delay: Duration::from_millis(config.scheduled_delay_ms),
        }
    }
}

enum Message {
    Span(SpanData),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Queues spans and exports them in batches from a background task.
pub struct BatchSpanProcessor {
    tx: mpsc::Sender<Message>,
    dropped: AtomicU64,
    reporter: FailureReporter,
}

impl BatchSpanProcessor {
    /// Start the worker on the current tokio runtime.
    pub fn new(exporter: Box<dyn SpanExporter>, config: BatchConfig) -> Result<Self, ExportError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ExportError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        handle.spawn(run_worker(exporter, rx, config));

        Ok(Self {
            tx,
            dropped: AtomicU64::new(0),
            reporter: FailureReporter::new("span queue"),
        })
    }

    /// Number of spans discarded because the queue was full or closed.
    pub fn dropped_spans(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Message) -> Result<(), ExportError> {
        let (ack, done) = oneshot::channel();
        self.tx.send(make(ack)).await.map_err(|_| ExportError::Closed)?;
        done.await.map_err(|_| ExportError::Closed)
    }
}

#[async_trait]
impl SpanProcessor for BatchSpanProcessor {
    fn on_end(&self, span: SpanData) {
        let err = match self.tx.try_send(Message::Span(span)) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => ExportError::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => ExportError::Closed,
        };
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.reporter.report(&err);
    }

    async fn force_flush(&self) -> Result<(), ExportError> {
        self.request(Message::Flush).await
    }

    /// Export everything queued, then stop the worker. Idempotent.
    async fn shutdown(&self) -> Result<(), ExportError> {
        match self.request(Message::Shutdown).await {
            Err(ExportError::Closed) => Ok(()),
            other => other,
        }
    }
}

async fn run_worker(
    exporter: Box<dyn SpanExporter>,
    mut rx: mpsc::Receiver<Message>,
    config: BatchConfig,
) {
    let reporter = FailureReporter::new("span export");
    let max_batch = config.max_batch_size.max(1);
    let mut batch: Vec<SpanData> = Vec::with_capacity(max_batch);
    let mut shutdown_ack = None;

    let period = config.scheduled_delay.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Span(span)) => {
                    batch.push(span);
                    if batch.len() >= max_batch {
                        export_batch(exporter.as_ref(), &mut batch, max_batch, &reporter).await;
                        ticker.reset();
                    }
                }
                Some(Message::Flush(ack)) => {
                    export_batch(exporter.as_ref(), &mut batch, max_batch, &reporter).await;
                    let _ = ack.send(());
                }
                // Closing still yields what is already queued.
                Some(Message::Shutdown(ack)) => {
                    rx.close();
                    shutdown_ack = Some(ack);
                }
                None => break,
            },
            _ = ticker.tick() => {
                export_batch(exporter.as_ref(), &mut batch, max_batch, &reporter).await;
            }
        }
    }

    export_batch(exporter.as_ref(), &mut batch, max_batch, &reporter).await;
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
    tracing::debug!("span export worker stopped");
}

async fn export_batch(
    exporter: &dyn SpanExporter,
    batch: &mut Vec<SpanData>,
    max_batch: usize,
    reporter: &FailureReporter,
) {
    for chunk in batch.chunks(max_batch) {
        if let Err(e) = exporter.export(chunk).await {
            reporter.report(&e);
        }
    }
    batch.clear();
}

#[derive(Serialize)]
struct Envelope<'a> {
    service: &'a str,
    spans: &'a [SpanData],
}

/// Sends each batch as JSON datagrams to a collector agent.
pub struct UdpJsonExporter {
    socket: OnceCell<UdpSocket>,
    agent: String,
    service_name: String,
}

impl UdpJsonExporter {
    /// The socket is bound on first export.
    pub fn new(service_name: impl Into<String>, host: &str, port: u16) -> Result<Self, ExportError> {
        if host.is_empty() {
            return Err(ExportError::Resolve(format!(":{port}")));
        }
        Ok(Self {
            socket: OnceCell::new(),
            agent: format!("{host}:{port}"),
            service_name: service_name.into(),
        })
    }

    /// Encode `spans` into datagrams, halving batches that are too large.
    fn encode(&self, spans: &[SpanData], out: &mut Vec<Vec<u8>>) -> Result<(), ExportError> {
        let payload = serde_json::to_vec(&Envelope {
            service: &self.service_name,
            spans,
        })?;
        if payload.len() <= MAX_DATAGRAM_BYTES {
            out.push(payload);
            return Ok(());
        }
        if spans.len() == 1 {
            return Err(ExportError::Oversized(spans[0].name.clone()));
        }
        let (left, right) = spans.split_at(spans.len() / 2);
        self.encode(left, out)?;
        self.encode(right, out)
    }
}

#[async_trait]
impl SpanExporter for UdpJsonExporter {
    async fn export(&self, batch: &[SpanData]) -> Result<(), ExportError> {
        let mut datagrams = Vec::new();
        self.encode(batch, &mut datagrams)?;

        let socket = self
            .socket
            .get_or_try_init(|| UdpSocket::bind(("0.0.0.0", 0)))
            .await?;
        // Resolved per batch: the agent may come up after this process.
        let target = tokio::net::lookup_host(&self.agent)
            .await?
            .next()
            .ok_or_else(|| ExportError::Resolve(self.agent.clone()))?;
        for datagram in &datagrams {
            socket.send_to(datagram, target).await?;
        }
        Ok(())
    }
}

/// Writes spans to the diagnostic log at debug level.
#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl SpanExporter for LogExporter {
    async fn export(&self, batch: &[SpanData]) -> Result<(), ExportError> {
        for span in batch {
            let duration = span
                .end_time
                .duration_since(span.start_time)
                .unwrap_or_default();
            tracing::debug!(
                target: "spans",
                span_name = %span.name,
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                parent_span_id = ?span.parent_span_id.map(|id| id.to_string()),
                duration_us = duration.as_micros() as u64,
                status = ?span.status,
                attributes = ?span.attributes,
                "span completed"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Collected {
    spans: Vec<SpanData>,
    batches: usize,
}

/// Collects spans in memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    collected: Arc<Mutex<Collected>>,
}

impl InMemoryExporter {
    pub fn spans(&self) -> Vec<SpanData> {
        self.lock().spans.clone()
    }

    /// Number of `export` calls received.
    pub fn batches(&self) -> usize {
        self.lock().batches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpanExporter for InMemoryExporter {
    async fn export(&self, batch: &[SpanData]) -> Result<(), ExportError> {
        let mut collected = self.lock();
        collected.spans.extend_from_slice(batch);
        collected.batches += 1;
        Ok(())
    }
}
