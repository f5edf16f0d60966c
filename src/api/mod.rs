use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub mod handlers;

/// Intake surface plus health and metrics.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/payload-receiver", post(handlers::receive_payload))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
