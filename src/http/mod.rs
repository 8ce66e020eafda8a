//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, access tracing)
//!     → request.rs (axum request → instrumentation Request)
//!     → instrumentation (span, handler, metrics, request log)
//!     → response.rs (Reply → HTTP response)
//!     → Send to client
//! ```

pub mod handlers;
pub mod request;
pub mod response;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{build_router, AppState, HttpServer};
