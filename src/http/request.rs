//! Request extraction.
//!
//! # Responsibilities
//! - Convert an axum request into the transport-neutral [`Request`]
//! - Carry the peer address and request ID into the instrumentation layer
//!
//! # Design Decisions
//! - Request ID is assigned by `SetRequestIdLayer` before any handler runs
//! - Client IP is the direct peer; forwarding headers are not trusted

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;

use crate::instrumentation::Request;

/// Header carrying the per-request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Build a [`Request`] from an incoming axum request and its path parameters.
pub fn from_http(request: &axum::extract::Request, params: BTreeMap<String, String>) -> Request {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Request {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        params,
        headers: request.headers().clone(),
        client_ip,
        request_id,
    }
}
