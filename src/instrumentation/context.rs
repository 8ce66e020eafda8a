//! Per-request state for one instrumented invocation.
//!
//! # Stages
//! ```text
//! Started → SpanOpen → HandlerRunning → SpanClosed
//!         → MetricsRecorded → Logged → Done
//! ```
//! Stages only move forward one step at a time. The span is held by a
//! guard, so dropping the context (cancelled request) still ends it.

use std::time::{Duration, Instant};

use crate::observability::tracing::{Span, SpanGuard, Tracer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Started,
    SpanOpen,
    HandlerRunning,
    SpanClosed,
    MetricsRecorded,
    Logged,
    Done,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Started => Some(Stage::SpanOpen),
            Stage::SpanOpen => Some(Stage::HandlerRunning),
            Stage::HandlerRunning => Some(Stage::SpanClosed),
            Stage::SpanClosed => Some(Stage::MetricsRecorded),
            Stage::MetricsRecorded => Some(Stage::Logged),
            Stage::Logged => Some(Stage::Done),
            Stage::Done => None,
        }
    }
}

/// Request-scoped timing, span and stage. Never shared between requests.
pub struct RequestContext {
    started: Instant,
    span: SpanGuard,
    stage: Stage,
}

impl RequestContext {
    /// Record the start time, then open the request span.
    pub fn start(tracer: &Tracer, span_name: &str) -> Self {
        let started = Instant::now();
        let span = tracer.start_scoped(span_name, None);
        let mut ctx = Self {
            started,
            span,
            stage: Stage::Started,
        };
        ctx.advance(Stage::SpanOpen);
        ctx
    }

    pub fn span(&self) -> &Span {
        self.span.span()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to the next stage.
    pub fn advance(&mut self, next: Stage) {
        debug_assert_eq!(
            self.stage.next(),
            Some(next),
            "request stage skipped: {:?} -> {:?}",
            self.stage,
            next
        );
        tracing::trace!(span = %self.span.name(), from = ?self.stage, to = ?next, "request stage");
        self.stage = next;
    }

    /// End the request span and move to [`Stage::SpanClosed`].
    pub fn close_span(&mut self) {
        self.span.end();
        self.advance(Stage::SpanClosed);
    }

    /// Time since the context was started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
