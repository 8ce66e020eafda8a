//! Request instrumentation pipeline.
//!
//! # Data Flow
//! ```text
//! Request (from the HTTP front end)
//!     → handler.rs (InstrumentedHandler::call)
//!         → context.rs (start time, request span, stage tracking)
//!         → business handler (Reply or HandlerError)
//!         → span closed → metrics recorded → request log line
//!     → Reply (status, body) back to the front end
//! ```
//!
//! # Design Decisions
//! - Route wrapping is plain composition: `Telemetry::instrument(route, handler)`
//! - Observability components are injected through `Telemetry`, no globals
//! - Failures never escape the wrapper; the client sees a generic 500

pub mod context;
pub mod handler;
pub mod request;
pub mod telemetry;

pub use context::{RequestContext, Stage};
pub use handler::{Handler, HandlerError, InstrumentedHandler, Route, INTERNAL_ERROR_BODY};
pub use request::{Reply, Request};
pub use telemetry::Telemetry;
