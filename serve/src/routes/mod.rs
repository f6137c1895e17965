//! Route handlers and shared response helpers.

pub mod admin;
pub mod chat;
pub mod conversations;
pub mod users;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// `{success: true, data}` envelope for non-SSE endpoints.
pub(crate) fn ok(data: serde_json::Value) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// `{success: false, error}` with the given status.
pub(crate) fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

pub(crate) fn bad_request(message: impl Into<String>) -> Response {
    error(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn not_found(message: impl Into<String>) -> Response {
    error(StatusCode::NOT_FOUND, message)
}

pub(crate) fn internal(err: impl std::fmt::Display) -> Response {
    tracing::error!("request failed: {}", err);
    error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
