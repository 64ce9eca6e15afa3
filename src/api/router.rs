use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::metrics::ServiceMetrics;
use crate::registry::ShardRegistry;

use super::handlers::*;

/// Application state shared across all handlers
pub struct AppState {
    pub registry: Arc<ShardRegistry>,
    pub metrics: Arc<ServiceMetrics>,
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Logical-index operations
        .route("/api/index/:name/query", post(query_index))
        .route("/api/index/:name/count", get(count_index))
        // Health and metrics
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
