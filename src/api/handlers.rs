use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::app::AppState;
use crate::errors::AppError;
use crate::models::message::PayloadProcessingResult;

#[derive(Debug, Deserialize)]
pub struct ReceiverQuery {
    #[serde(rename = "tenantId")]
    pub tenant_id: Option<String>,
}

/// `POST /payload-receiver?tenantId=<id>`; the caller may pass its Tcv in
/// `x-tcv`.
pub async fn receive_payload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReceiverQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PayloadProcessingResult>, AppError> {
    let tenant_id = query
        .tenant_id
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingTenant)?;
    let tcv = headers.get("x-tcv").and_then(|v| v.to_str().ok());

    let result = state.intake.accept(tenant_id, &body, tcv).await?;
    Ok(Json(result))
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    Json(json!({
        "status": "ok",
        "tenants": snapshot.len(),
        "tenants_loaded_at": snapshot.loaded_at(),
    }))
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::encode_metrics(),
    )
}
