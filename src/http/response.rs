//! Response conversion.
//!
//! # Responsibilities
//! - Turn a handler [`Reply`] into an HTTP response
//!
//! # Design Decisions
//! - Bodies are plain text (`text/plain; charset=utf-8`)
//! - Request-log fields stay server-side and never reach the client

use axum::response::{IntoResponse, Response};

use crate::instrumentation::Reply;

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};

    #[test]
    fn reply_becomes_plain_text_response() {
        let response = Reply::new(StatusCode::CREATED, "made\n")
            .with_log_field("secret", "x")
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert!(response.headers().get("secret").is_none());
    }
}
