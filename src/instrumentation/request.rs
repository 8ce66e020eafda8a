//! Transport-neutral request and reply values seen by handlers.

use std::collections::BTreeMap;
use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

/// An inbound request, already routed.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw URI path, e.g. `/hello/world`.
    pub path: String,
    /// Captured path parameters, e.g. `name → world`.
    pub params: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub request_id: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: BTreeMap::new(),
            headers: HeaderMap::new(),
            client_ip: None,
            request_id: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// What a handler produces: status, body and extra request-log fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
    pub log_fields: Vec<(String, String)>,
}

impl Reply {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            log_fields: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// Add a field to the request log line for this request.
    pub fn with_log_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.log_fields.push((key.into(), value.to_string()));
        self
    }
}
