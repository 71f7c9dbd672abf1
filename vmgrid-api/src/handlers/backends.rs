use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use vmgrid_orchestrator::BackendHealth;

use crate::app::state::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BackendHealthResponse {
    pub name: String,
    /// False after repeated transient failures, until the cooldown allows a probe.
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Position in the configured preference list.
    pub preference_rank: Option<usize>,
}

impl From<BackendHealth> for BackendHealthResponse {
    fn from(h: BackendHealth) -> Self {
        Self {
            name: h.name,
            healthy: h.healthy,
            consecutive_failures: h.consecutive_failures,
            preference_rank: h.preference_rank,
        }
    }
}

#[utoipa::path(
    get,
    path = "/backends",
    responses(
        (status = 200, description = "Registered backends and their health", body = Vec<BackendHealthResponse>)
    )
)]
pub async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Vec<BackendHealthResponse>> {
    Json(
        state
            .orchestrator
            .backend_health()
            .into_iter()
            .map(BackendHealthResponse::from)
            .collect(),
    )
}
