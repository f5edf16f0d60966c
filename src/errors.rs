use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::bus::BusError;

/// A tenant converter could not turn raw bytes into a canonical request.
/// Re-delivery never changes the outcome.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("payload does not match the tenant schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("payload shape is invalid: {0}")]
    Shape(String),
}

/// The tenant registry cannot produce strategies for a tenant.
/// Terminal: the message goes straight to dead-letter.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),

    #[error("tenant '{tenant_id}' references unknown strategy tag '{tag}'")]
    UnknownStrategy { tenant_id: String, tag: String },

    #[error("tenant '{tenant_id}' references unknown validation tag '{tag}'")]
    UnknownValidation { tenant_id: String, tag: String },
}

/// Errors surfaced synchronously by the intake gateway.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] ConversionError),

    #[error(transparent)]
    TenantResolution(#[from] ResolutionError),

    #[error("tenant '{0}' is disabled")]
    TenantDisabled(String),

    #[error("{operation} failed after {attempts} attempts: {message}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// A processing pass could not settle its message. The worker abandons the
/// delivery so the bus redelivers it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("audit write failed: {0}")]
    Audit(anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// HTTP-facing error for the intake surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error("missing tenantId query parameter")]
    MissingTenant,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::MissingTenant => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "missing_tenant",
                self.to_string(),
            ),
            AppError::Intake(IntakeError::MalformedPayload(e)) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "malformed_payload",
                e.to_string(),
            ),
            AppError::Intake(IntakeError::TenantResolution(e)) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "unknown_tenant",
                e.to_string(),
            ),
            AppError::Intake(IntakeError::TenantDisabled(_)) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "tenant_disabled",
                self.to_string(),
            ),
            AppError::Intake(IntakeError::Transient { operation, .. }) => {
                tracing::error!("intake transient failure: {}", self);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "transient_error",
                    "infrastructure_unavailable",
                    format!("{} is temporarily unavailable, retry the request", operation),
                )
            }
            AppError::Intake(IntakeError::Internal(e)) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("30"),
            );
        }

        response
    }
}
