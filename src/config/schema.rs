//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::observability::metrics::DEFAULT_LATENCY_BUCKETS;

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Service identity reported to the trace collector.
    pub service: ServiceConfig,

    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Span export settings.
    pub tracing: TracingConfig,

    /// Metric registry settings.
    pub metrics: MetricsConfig,

    /// Diagnostic logging settings.
    pub observability: ObservabilityConfig,

    /// Route handler behaviour.
    pub handlers: HandlerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "sample-app".to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
        }
    }
}

/// Where completed spans are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    /// JSON datagrams to the collector agent.
    Udp,
    /// Debug-level diagnostic log lines.
    Log,
    /// Spans are created but discarded.
    None,
}

/// Span export configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub exporter: ExporterKind,

    /// Collector agent host (docker-compose service name by default).
    pub agent_host: String,

    /// Collector agent UDP port.
    pub agent_port: u16,

    /// Spans buffered before new ones are dropped.
    pub max_queue_size: usize,

    /// Spans sent per export call.
    pub max_batch_size: usize,

    /// Flush interval in milliseconds.
    pub scheduled_delay_ms: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            exporter: ExporterKind::Udp,
            agent_host: "jaeger".to_string(),
            agent_port: 6831,
            max_queue_size: 2048,
            max_batch_size: 512,
            scheduled_delay_ms: 5000,
        }
    }
}

/// Metric registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Latency histogram upper bounds in seconds, ascending.
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Diagnostic log filter (trace, debug, info, warn, error or directives).
    pub log_level: String,

    /// Request log lines buffered before new ones are dropped.
    pub log_queue_size: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_queue_size: 8192,
        }
    }
}

/// Route handler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Simulated work for `GET /` in milliseconds.
    pub index_work_ms: u64,

    /// Simulated work for `GET /hello/{name}` in milliseconds.
    pub hello_work_ms: u64,

    /// Per-request handler timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            index_work_ms: 50,
            hello_work_ms: 30,
            timeout_secs: 30,
        }
    }
}
