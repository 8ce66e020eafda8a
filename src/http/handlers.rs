//! Business handlers for the greeting routes.
//!
//! These know nothing about metrics or logging; they are wrapped by
//! [`Telemetry::instrument`](crate::instrumentation::Telemetry::instrument)
//! when the router is built.

use std::time::Duration;

use crate::instrumentation::{Handler, HandlerError, Reply, Request};
use crate::observability::Span;

pub const INDEX_BODY: &str = "Hello from sample app!\n";
pub const HEALTHZ_BODY: &str = "ok\n";

/// Longest user agent copied into the request log.
const MAX_USER_AGENT_CHARS: usize = 100;

async fn simulate_work(work: Duration) {
    if !work.is_zero() {
        tokio::time::sleep(work).await;
    }
}

/// `GET /`
pub fn index(work: Duration) -> impl Handler {
    move |request: Request, _span: Span| async move {
        simulate_work(work).await;
        let user_agent: String = request
            .header("user-agent")
            .unwrap_or_default()
            .chars()
            .take(MAX_USER_AGENT_CHARS)
            .collect();
        Ok::<_, HandlerError>(Reply::ok(INDEX_BODY).with_log_field("user_agent", user_agent))
    }
}

/// `GET /hello/{name}`
pub fn hello(work: Duration) -> impl Handler {
    move |request: Request, span: Span| async move {
        let Some(name) = request.param("name").map(str::to_string) else {
            return Err(HandlerError::msg("missing name parameter"));
        };
        span.set_attribute("app.user_name", name.clone());
        simulate_work(work).await;
        Ok(Reply::ok(format!("Hello {name}!\n")).with_log_field("name", name))
    }
}
