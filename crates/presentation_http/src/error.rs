//! Error bodies produced by the instrumentation layers

use std::convert::Infallible;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, IntoResponseParts, Response, ResponseParts},
};
use serde::Serialize;

/// Body returned when a handler panicked
///
/// Deliberately generic: the panic message only goes to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub path: String,
}

impl ErrorResponse {
    pub fn internal(path: impl Into<String>, trace_id: Option<String>) -> Self {
        Self {
            error: "Internal Server Error".to_string(),
            message: "An unexpected error occurred. Please try again later.".to_string(),
            trace_id,
            path: path.into(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Error detail a handler attaches to its response for the request log
///
/// Travels as a response extension and never reaches the client.
///
/// ```ignore
/// async fn handler() -> impl IntoResponse {
///     (StatusCode::BAD_GATEWAY, HandlerError::new("upstream timed out"), "try again")
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl IntoResponseParts for HandlerError {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        res.extensions_mut().insert(self);
        Ok(res)
    }
}
