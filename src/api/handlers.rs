use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::NautexError;
use crate::query;

use super::router::AppState;

/// Error wrapper for API handlers
pub enum ApiError {
    Nautex(NautexError),
    Internal(String),
}

impl From<NautexError> for ApiError {
    fn from(e: NautexError) -> Self {
        ApiError::Nautex(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Nautex(e) => {
                let (status, error_type) = match &e {
                    NautexError::AlreadyClosed => (StatusCode::SERVICE_UNAVAILABLE, "already_closed"),
                    NautexError::RouteUnknown(_) => (StatusCode::NOT_FOUND, "route_unknown"),
                    NautexError::ConsistencyUnsupported(_) => {
                        (StatusCode::BAD_REQUEST, "consistency_unsupported")
                    }
                    NautexError::ConsistencyClosed => {
                        (StatusCode::SERVICE_UNAVAILABLE, "consistency_closed")
                    }
                    NautexError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
                    NautexError::Corrupt(_) => (StatusCode::INTERNAL_SERVER_ERROR, "corrupt"),
                    NautexError::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "engine_error"),
                    NautexError::RollbackRequested { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "rollback_requested")
                    }
                    NautexError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                    NautexError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
                    NautexError::Serialization(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
                    }
                    NautexError::Json(_) => (StatusCode::BAD_REQUEST, "json_error"),
                };
                (status, error_type, e.to_string())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Deserialize, Default)]
pub struct IndexParams {
    #[serde(default)]
    pub uuid: String,
}

#[derive(Serialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Query a logical index; the body is the wire query request.
pub async fn query_index(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<IndexParams>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();
    state.metrics.queries_total.inc();

    let registry = Arc::clone(&state.registry);
    let result = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        query::query_index(&registry, &name, &params.uuid, &body, &mut out).map(|_| out)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("query task failed: {e}")))?;

    match result {
        Ok(out) => {
            state.metrics.observe_search("ok", start.elapsed());
            Ok(([(header::CONTENT_TYPE, "application/json")], out))
        }
        Err(err) => {
            state.metrics.query_errors.inc();
            state.metrics.observe_search("error", start.elapsed());
            Err(err.into())
        }
    }
}

/// Doc count across every target covering a logical index.
pub async fn count_index(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<IndexParams>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = Arc::clone(&state.registry);
    let count = tokio::task::spawn_blocking(move || {
        query::count_index(&registry, &name, &params.uuid)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("count task failed: {e}")))??;

    Ok(Json(CountResponse { count }))
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": crate::VERSION }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let rendered = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], rendered))
}
