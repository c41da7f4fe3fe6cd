//! Read-only execution status routes.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::warn;

use crate::tracking::{ExecutionReader, TrackingError};

pub fn tracking_router(reader: Arc<dyn ExecutionReader>) -> Router {
    Router::new()
        .route("/executions/{id}", get(get_execution))
        .route(
            "/executions/{id}/feature-importance",
            get(get_feature_importance),
        )
        .with_state(TrackingAppState { reader })
}

#[derive(Clone)]
struct TrackingAppState {
    reader: Arc<dyn ExecutionReader>,
}

async fn get_execution(
    State(state): State<TrackingAppState>,
    Path(id): Path<String>,
) -> Response {
    match state.reader.execution(&id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(&id),
        Err(err) => internal_error(&id, err),
    }
}

async fn get_feature_importance(
    State(state): State<TrackingAppState>,
    Path(id): Path<String>,
) -> Response {
    match state.reader.feature_importance(&id) {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => not_found(&id),
        Err(err) => internal_error(&id, err),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("execution {id} not found") })),
    )
        .into_response()
}

fn internal_error(id: &str, err: TrackingError) -> Response {
    warn!(
        component = "tracking_server",
        event = "tracking_server.read_failed",
        exec_id = %id,
        error = %err
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
