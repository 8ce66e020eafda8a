//! Instrumented sample HTTP service library.

pub mod config;
pub mod http;
pub mod instrumentation;
pub mod lifecycle;
pub mod observability;

pub use config::AppConfig;
pub use http::HttpServer;
pub use instrumentation::{InstrumentedHandler, Telemetry};
pub use lifecycle::Shutdown;
