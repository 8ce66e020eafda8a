//! Distributed tracing support.
//!
//! # Responsibilities
//! - Create spans for request handling, optionally nested under a parent
//! - Attach attributes and status while a span is open
//! - Close each span exactly once and hand an immutable copy to the processor
//!
//! # Design Decisions
//! - A [`Span`] is a cheap handle; clones refer to the same span
//! - Parents are linked by id only, no lock is held across spans
//! - [`SpanGuard`] closes the span on drop, so early returns, errors, panics
//!   and cancelled futures all end it
//! - End time is derived from a monotonic clock, so `end >= start` holds

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};

use serde::{Serialize, Serializer};

use crate::observability::export::SpanProcessor;

/// 128-bit trace identifier, rendered as 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub u128);

/// 64-bit span identifier, rendered as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

impl TraceId {
    fn random() -> Self {
        // Zero is the invalid id in W3C trace context.
        Self(fastrand::u128(1..))
    }
}

impl SpanId {
    fn random() -> Self {
        Self(fastrand::u64(1..))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Value of a span attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u16> for AttributeValue {
    fn from(v: u16) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Outcome recorded on a span.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error { message: String },
}

impl SpanStatus {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Immutable record of a completed span, as handed to exporters.
#[derive(Debug, Clone, Serialize)]
pub struct SpanData {
    pub name: String,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub attributes: Vec<(String, AttributeValue)>,
    pub status: SpanStatus,
}

impl SpanData {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Debug)]
struct OpenState {
    attributes: Vec<(String, AttributeValue)>,
    status: SpanStatus,
}

#[derive(Debug)]
struct SpanInner {
    name: String,
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    start_time: SystemTime,
    started: Instant,
    /// `None` once the span has been ended.
    open: Mutex<Option<OpenState>>,
}

/// Handle to a span. Clones share the same underlying span.
#[derive(Debug, Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl Span {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.inner.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.inner.parent_span_id
    }

    pub fn is_ended(&self) -> bool {
        self.lock().is_none()
    }

    /// Attach an attribute, replacing any previous value for `key`.
    /// Ignored once the span has ended.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let mut open = self.lock();
        let Some(state) = open.as_mut() else {
            tracing::debug!(span = %self.inner.name, key = %key, "set_attribute on ended span ignored");
            return;
        };
        let value = value.into();
        match state.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => state.attributes.push((key, value)),
        }
    }

    /// Record the span outcome. Ignored once the span has ended.
    pub fn set_status(&self, status: SpanStatus) {
        match self.lock().as_mut() {
            Some(state) => state.status = status,
            None => tracing::debug!(span = %self.inner.name, "set_status on ended span ignored"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<OpenState>> {
        self.inner.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the span, returning its final data if this call ended it.
    fn finish(&self) -> Option<SpanData> {
        let state = self.lock().take()?;
        let status = match state.status {
            SpanStatus::Unset => SpanStatus::Ok,
            other => other,
        };
        Some(SpanData {
            name: self.inner.name.clone(),
            trace_id: self.inner.trace_id,
            span_id: self.inner.span_id,
            parent_span_id: self.inner.parent_span_id,
            start_time: self.inner.start_time,
            end_time: self.inner.start_time + self.inner.started.elapsed(),
            attributes: state.attributes,
            status,
        })
    }
}

struct TracerInner {
    service_name: String,
    processor: Arc<dyn SpanProcessor>,
}

/// Creates spans and forwards completed ones to a [`SpanProcessor`].
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.inner.service_name)
            .finish_non_exhaustive()
    }
}

impl Tracer {
    pub fn new(service_name: impl Into<String>, processor: Arc<dyn SpanProcessor>) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                service_name: service_name.into(),
                processor,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn processor(&self) -> &Arc<dyn SpanProcessor> {
        &self.inner.processor
    }

    /// Begin a span. With a parent, the span joins the parent's trace.
    pub fn start_span(&self, name: impl Into<String>, parent: Option<&Span>) -> Span {
        let (trace_id, parent_span_id) = match parent {
            Some(p) => (p.trace_id(), Some(p.span_id())),
            None => (TraceId::random(), None),
        };
        Span {
            inner: Arc::new(SpanInner {
                name: name.into(),
                trace_id,
                span_id: SpanId::random(),
                parent_span_id,
                start_time: SystemTime::now(),
                started: Instant::now(),
                open: Mutex::new(Some(OpenState {
                    attributes: Vec::new(),
                    status: SpanStatus::Unset,
                })),
            }),
        }
    }

    /// Begin a span that is ended when the returned guard drops.
    pub fn start_scoped(&self, name: impl Into<String>, parent: Option<&Span>) -> SpanGuard {
        SpanGuard {
            span: self.start_span(name, parent),
            tracer: self.clone(),
        }
    }

    pub fn set_attribute(&self, span: &Span, key: impl Into<String>, value: impl Into<AttributeValue>) {
        span.set_attribute(key, value);
    }

    pub fn set_status(&self, span: &Span, status: SpanStatus) {
        span.set_status(status);
    }

    /// Close `span` and enqueue it for export. Returns `false` if it was
    /// already closed, in which case nothing is exported.
    pub fn end_span(&self, span: &Span) -> bool {
        match span.finish() {
            Some(data) => {
                self.inner.processor.on_end(data);
                true
            }
            None => {
                tracing::debug!(span = %span.name(), "end_span on ended span ignored");
                false
            }
        }
    }
}

/// Ends its span when dropped.
pub struct SpanGuard {
    span: Span,
    tracer: Tracer,
}

impl SpanGuard {
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// End the span now. Returns `false` if it had already ended.
    pub fn end(&self) -> bool {
        self.tracer.end_span(&self.span)
    }
}

impl std::ops::Deref for SpanGuard {
    type Target = Span;
    fn deref(&self) -> &Self::Target {
        &self.span
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.span.is_ended() {
            self.tracer.end_span(&self.span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::export::{InMemoryExporter, SimpleSpanProcessor};

    fn tracer() -> (Tracer, InMemoryExporter) {
        let exporter = InMemoryExporter::default();
        let processor = SimpleSpanProcessor::new(Box::new(exporter.clone()));
        (Tracer::new("test-service", Arc::new(processor)), exporter)
    }

    #[test]
    fn end_span_exports_once() {
        let (tracer, exporter) = tracer();
        let span = tracer.start_span("work", None);
        assert!(tracer.end_span(&span));
        assert!(!tracer.end_span(&span));
        assert_eq!(exporter.spans().len(), 1);
        assert_eq!(exporter.batches(), 1);
    }

    #[test]
    fn exported_span_is_ok_with_ordered_times() {
        let (tracer, exporter) = tracer();
        let span = tracer.start_span("work", None);
        span.set_attribute("app.user_name", "world");
        span.set_attribute("app.retries", 2i64);
        span.set_attribute("app.user_name", "again");
        tracer.end_span(&span);

        let data = &exporter.spans()[0];
        assert_eq!(data.name, "work");
        assert_eq!(data.status, SpanStatus::Ok);
        assert!(data.end_time >= data.start_time);
        assert_eq!(data.attributes.len(), 2);
        assert_eq!(data.attribute("app.user_name"), Some(&AttributeValue::from("again")));
    }

    #[test]
    fn mutations_after_end_are_ignored() {
        let (tracer, exporter) = tracer();
        let span = tracer.start_span("work", None);
        tracer.end_span(&span);
        tracer.set_attribute(&span, "late", true);
        tracer.set_status(&span, SpanStatus::error("late"));
        assert!(span.is_ended());
        let data = &exporter.spans()[0];
        assert!(data.attributes.is_empty());
        assert_eq!(data.status, SpanStatus::Ok);
    }

    #[test]
    fn child_span_joins_parent_trace() {
        let (tracer, exporter) = tracer();
        let parent = tracer.start_span("parent", None);
        let child = tracer.start_span("child", Some(&parent));
        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_span_id(), Some(parent.span_id()));
        assert_ne!(child.span_id(), parent.span_id());

        // Parent and child are independent: either may end first.
        tracer.end_span(&parent);
        child.set_attribute("still_open", true);
        tracer.end_span(&child);
        let spans = exporter.spans();
        assert_eq!(spans[0].name, "parent");
        assert_eq!(spans[1].attribute("still_open"), Some(&AttributeValue::Bool(true)));
    }

    #[test]
    fn guard_ends_span_on_drop_and_on_panic() {
        let (tracer, exporter) = tracer();
        {
            let guard = tracer.start_scoped("scoped", None);
            guard.set_status(SpanStatus::error("boom"));
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = tracer.start_scoped("panicking", None);
            panic!("handler failure");
        }));
        assert!(result.is_err());

        let spans = exporter.spans();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].status.is_error());
        assert_eq!(spans[1].name, "panicking");
    }

    #[test]
    fn explicit_end_then_drop_exports_once() {
        let (tracer, exporter) = tracer();
        let guard = tracer.start_scoped("scoped", None);
        assert!(guard.end());
        drop(guard);
        assert_eq!(exporter.spans().len(), 1);
    }

    #[test]
    fn ids_render_as_fixed_width_hex() {
        assert_eq!(SpanId(0xab).to_string(), "00000000000000ab");
        assert_eq!(TraceId(1).to_string().len(), 32);
    }
}
