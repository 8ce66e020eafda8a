//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (batch sizes > 0, ports valid, buckets ascending)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::config::schema::{AppConfig, ExporterKind};

/// A single semantic problem with a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut check = |ok: bool, field: &'static str, message: String| {
        if !ok {
            errors.push(ValidationError { field, message });
        }
    };

    check(
        !config.service.name.trim().is_empty(),
        "service.name",
        "must not be empty".into(),
    );
    check(
        config.listener.bind_address.parse::<SocketAddr>().is_ok(),
        "listener.bind_address",
        format!("{:?} is not a socket address", config.listener.bind_address),
    );

    let tracing = &config.tracing;
    if tracing.exporter == ExporterKind::Udp {
        check(
            !tracing.agent_host.is_empty(),
            "tracing.agent_host",
            "must not be empty".into(),
        );
        check(tracing.agent_port != 0, "tracing.agent_port", "must not be 0".into());
    }
    check(
        tracing.max_batch_size > 0,
        "tracing.max_batch_size",
        "must be greater than 0".into(),
    );
    check(
        tracing.max_batch_size <= tracing.max_queue_size,
        "tracing.max_queue_size",
        format!("must be at least max_batch_size ({})", tracing.max_batch_size),
    );
    check(
        tracing.scheduled_delay_ms > 0,
        "tracing.scheduled_delay_ms",
        "must be greater than 0".into(),
    );

    let buckets = &config.metrics.latency_buckets;
    check(
        buckets.iter().all(|b| b.is_finite() && *b > 0.0),
        "metrics.latency_buckets",
        "bounds must be positive and finite".into(),
    );
    check(
        buckets.windows(2).all(|w| w[0] < w[1]),
        "metrics.latency_buckets",
        "bounds must be strictly ascending".into(),
    );

    check(
        EnvFilter::try_new(&config.observability.log_level).is_ok(),
        "observability.log_level",
        format!("{:?} is not a valid filter", config.observability.log_level),
    );
    check(
        config.observability.log_queue_size > 0,
        "observability.log_queue_size",
        "must be greater than 0".into(),
    );
    check(
        config.handlers.timeout_secs > 0,
        "handlers.timeout_secs",
        "must be greater than 0".into(),
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
