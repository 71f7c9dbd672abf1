use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use vmgrid_orchestrator::OrchestratorError;
use vmgrid_orchestrator::BackendError;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable code, e.g. `VALIDATION_ERROR` or `BACKEND_REJECTED`.
    pub error: String,
    pub message: String,
    /// Per-field problems for validation errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    InvalidBody { status: StatusCode, message: String },
    NotFound(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::NoAvailableBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Backend {
            source: BackendError::Timeout(_),
            ..
        } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Backend { .. } => StatusCode::BAD_GATEWAY,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidState { .. } => StatusCode::CONFLICT,
        OrchestratorError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Orchestrator(err) => {
                let fields = match &err {
                    OrchestratorError::Validation(v) => v
                        .fields
                        .iter()
                        .map(|f| format!("{} {}", f.field, f.message))
                        .collect(),
                    _ => Vec::new(),
                };
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::warn!(error = %err, code = err.code(), "request failed");
                }
                (
                    status,
                    ErrorResponse {
                        error: err.code().to_string(),
                        message: err.to_string(),
                        fields,
                    },
                )
            }
            ApiError::InvalidBody { status, message } => (
                status,
                ErrorResponse {
                    error: "INVALID_BODY".to_string(),
                    message,
                    fields: Vec::new(),
                },
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: "NOT_FOUND".to_string(),
                    message,
                    fields: Vec::new(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}
