//! Operational endpoints: runtime metrics, per-tool status, manual sweeps.

use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use super::{internal, ok};
use crate::app::AppState;

pub async fn metrics(State(state): State<AppState>) -> Response {
    match serde_json::to_value(state.services.metrics()) {
        Ok(snapshot) => ok(snapshot),
        Err(e) => internal(e),
    }
}

pub async fn tool_status(State(state): State<AppState>) -> Response {
    match serde_json::to_value(state.services.executor.metrics_snapshot()) {
        Ok(tools) => ok(json!({ "tools": tools })),
        Err(e) => internal(e),
    }
}

pub async fn trigger_lru(State(state): State<AppState>) -> Response {
    match state.services.archiver.sweep().await {
        Ok(report) => match serde_json::to_value(report) {
            Ok(report) => ok(report),
            Err(e) => internal(e),
        },
        Err(e) => internal(e),
    }
}
