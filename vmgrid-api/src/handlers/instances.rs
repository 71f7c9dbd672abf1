use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use vmgrid_common::{CreateInstanceRequest, InstanceRecord, ListInstancesResponse};

use crate::app::state::AppState;
use crate::error::{ApiError, ErrorResponse};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct GetInstanceParams {
    /// Re-check a running instance against its backend before answering.
    pub refresh: Option<bool>,
}

/// Malformed ids cannot name a record, so they are reported as not found.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("instance {raw} not found")))
}

// COMMAND : CREATE INSTANCE
#[utoipa::path(
    post,
    path = "/instances",
    request_body = CreateInstanceRequest,
    responses(
        (status = 201, description = "Instance accepted, state is pending", body = InstanceRecord),
        (status = 422, description = "Invalid request", body = ErrorResponse),
        (status = 502, description = "Backend refused or failed the create call", body = ErrorResponse),
        (status = 503, description = "No healthy backend available", body = ErrorResponse),
        (status = 504, description = "Backend create call timed out", body = ErrorResponse)
    )
)]
pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InstanceRecord>), ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::InvalidBody {
        status: rejection.status(),
        message: rejection.body_text(),
    })?;

    tracing::info!(
        name = %request.name,
        instance_type = %request.instance_type,
        backend = ?request.backend,
        "create instance requested"
    );
    let record = state.orchestrator.create_instance(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

// QUERY : LIST INSTANCES
#[utoipa::path(
    get,
    path = "/instances",
    responses(
        (status = 200, description = "Every instance record, in creation order", body = ListInstancesResponse)
    )
)]
pub async fn list_instances(State(state): State<Arc<AppState>>) -> Json<ListInstancesResponse> {
    Json(state.orchestrator.list_instances())
}

// QUERY : GET INSTANCE
#[utoipa::path(
    get,
    path = "/instances/{id}",
    params(
        ("id" = Uuid, Path, description = "Instance UUID"),
        GetInstanceParams
    ),
    responses(
        (status = 200, description = "Instance details", body = InstanceRecord),
        (status = 404, description = "Instance not found", body = ErrorResponse)
    )
)]
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<GetInstanceParams>,
) -> Result<Json<InstanceRecord>, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .orchestrator
        .get_instance(id, params.refresh.unwrap_or(false))
        .await?;
    Ok(Json(record))
}

// COMMAND : TERMINATE INSTANCE
#[utoipa::path(
    delete,
    path = "/instances/{id}",
    params(
        ("id" = Uuid, Path, description = "Instance UUID")
    ),
    responses(
        (status = 202, description = "Termination accepted", body = InstanceRecord),
        (status = 404, description = "Instance not found", body = ErrorResponse),
        (status = 409, description = "Instance is pending or failed", body = ErrorResponse)
    )
)]
pub async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<InstanceRecord>), ApiError> {
    let id = parse_id(&id)?;
    tracing::info!(instance_id = %id, "termination requested");
    let record = state.orchestrator.terminate_instance(id).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}
