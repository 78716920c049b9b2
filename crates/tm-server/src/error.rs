//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`tm_core::Error`] so that route handlers
//! can return `Result<T, AppError>` and use `?` on engine calls.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Body text for every 5xx response; internal details stay in the logs.
pub const GENERIC_FAILURE: &str = "Processing failed. Please try again.";

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: tm_core::Error,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: tm_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn inner(&self) -> &tm_core::Error {
        &self.inner
    }
}

impl From<tm_core::Error> for AppError {
    fn from(e: tm_core::Error) -> Self {
        Self::new(e)
    }
}

impl From<tm_core::Rejection> for AppError {
    fn from(r: tm_core::Rejection) -> Self {
        Self::new(r.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                request_id = self.request_id.as_deref(),
                "Server error in API handler"
            );
            GENERIC_FAILURE.to_string()
        } else {
            self.inner.to_string()
        };

        let body = json!({
            "success": false,
            "error": message,
            "code": self.inner.code(),
            "request_id": self.request_id,
        });

        (status, axum::Json(body)).into_response()
    }
}
