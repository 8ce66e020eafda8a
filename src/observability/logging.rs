//! Structured request logging.
//!
//! # Responsibilities
//! - Serialize one request log record to one logfmt line
//! - Hand lines to a single shared sink (stdout by default)
//!
//! # Data Flow
//! ```text
//! StructuredLogger::log
//!     → try_send into a bounded queue (never waits)
//!     → writer on tokio's blocking pool
//!     → LogSink::write_line
//! ```
//!
//! # Design Decisions
//! - Field order is the caller's order
//! - Whitespace inside a value becomes `_`; nothing else is escaped, so an
//!   `=` inside a value is written as-is
//! - A full or closed queue is an error for the caller, who decides how
//!   loud to be about it; write failures are reported by the writer
//!
//! Process diagnostics do not go through here; they use `tracing`.

use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::observability::report::FailureReporter;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log sink unavailable: {0}")]
    Io(#[from] io::Error),

    #[error("log queue is full, line dropped")]
    QueueFull,

    #[error("log writer has shut down")]
    Closed,

    #[error("a tokio runtime is required to start the log writer")]
    NoRuntime,
}

/// Ordered key/value fields making up one log line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRecord {
    fields: Vec<(String, String)>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, builder style.
    pub fn field(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Display) {
        self.fields.push((key.into(), value.to_string()));
    }

    pub fn extend(&mut self, fields: impl IntoIterator<Item = (String, String)>) {
        self.fields.extend(fields);
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render as `k1=v1 k2=v2 ...` without a trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            line.push_str(key);
            line.push('=');
            line.extend(value.chars().map(|c| if c.is_whitespace() { '_' } else { c }));
        }
        line
    }
}

impl<K: Into<String>, V: Display> FromIterator<(K, V)> for LogRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = LogRecord::new();
        for (k, v) in iter {
            record.push(k, v);
        }
        record
    }
}

/// Destination for serialized log lines.
pub trait LogSink: Send + Sync {
    /// Write one line; the sink appends the newline.
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Writes to the process standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Writes to any `Write` implementation, serialized by a mutex.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

/// Keeps lines in memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }
}

enum WriterMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
enum Output {
    /// Written on the caller's thread.
    Inline(Arc<dyn LogSink>),
    /// Queued for the background writer.
    Queued(mpsc::Sender<WriterMessage>),
}

/// Emits logfmt lines to a shared sink.
#[derive(Clone)]
pub struct StructuredLogger {
    output: Output,
}

impl std::fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.output {
            Output::Inline(_) => "inline",
            Output::Queued(_) => "queued",
        };
        f.debug_struct("StructuredLogger").field("mode", &mode).finish()
    }
}

impl StructuredLogger {
    /// Write through `sink` on the calling thread. Only for sinks that never
    /// block, such as [`MemorySink`].
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            output: Output::Inline(sink),
        }
    }

    /// Queue lines for a writer running on tokio's blocking pool. At most
    /// `capacity` lines wait in the queue; `log` never waits for the sink.
    pub fn spawn(sink: Arc<dyn LogSink>, capacity: usize) -> Result<(Self, LogWriter), LogError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| LogError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = handle.spawn_blocking(move || run_writer(sink, rx));
        let logger = Self {
            output: Output::Queued(tx.clone()),
        };
        Ok((logger, LogWriter { tx, task }))
    }

    /// Queued logger writing to standard output.
    pub fn stdout(capacity: usize) -> Result<(Self, LogWriter), LogError> {
        Self::spawn(Arc::new(StdoutSink), capacity)
    }

    pub fn log(&self, record: &LogRecord) -> Result<(), LogError> {
        let line = record.to_line();
        match &self.output {
            Output::Inline(sink) => sink.write_line(&line)?,
            Output::Queued(tx) => tx
                .try_send(WriterMessage::Line(line))
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => LogError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => LogError::Closed,
                })?,
        }
        Ok(())
    }

    /// Wait until every line queued so far has been handed to the sink.
    pub async fn flush(&self) -> Result<(), LogError> {
        let Output::Queued(tx) = &self.output else {
            return Ok(());
        };
        let (ack, done) = oneshot::channel();
        tx.send(WriterMessage::Flush(ack))
            .await
            .map_err(|_| LogError::Closed)?;
        done.await.map_err(|_| LogError::Closed)
    }
}

/// Handle to the background writer started by [`StructuredLogger::spawn`].
pub struct LogWriter {
    tx: mpsc::Sender<WriterMessage>,
    task: JoinHandle<()>,
}

impl LogWriter {
    /// Write out every queued line and stop. Later `log` calls fail with
    /// [`LogError::Closed`].
    pub async fn shutdown(self) -> Result<(), LogError> {
        let _ = self.tx.send(WriterMessage::Shutdown).await;
        self.task.await.map_err(|_| LogError::Closed)
    }
}

fn run_writer(sink: Arc<dyn LogSink>, mut rx: mpsc::Receiver<WriterMessage>) {
    let reporter = FailureReporter::new("request log write");
    while let Some(message) = rx.blocking_recv() {
        match message {
            WriterMessage::Line(line) => {
                if let Err(e) = sink.write_line(&line) {
                    reporter.report(&e);
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            // Closing still yields what is already queued.
            WriterMessage::Shutdown => rx.close(),
        }
    }
    tracing::debug!("request log writer stopped");
}
