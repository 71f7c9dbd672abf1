use uuid::Uuid;
use vmgrid_common::{InstanceState, ValidationErrors};
use vmgrid_providers::BackendError;

use crate::registry::RegistryError;

/// Errors surfaced by the orchestrator facade.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("no available backend: {0}")]
    NoAvailableBackend(String),

    #[error("backend {backend} failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("instance {0} not found")]
    NotFound(Uuid),

    #[error("cannot {operation} instance {id} in state {state}")]
    InvalidState {
        id: Uuid,
        state: InstanceState,
        operation: &'static str,
    },

    #[error("registry rejected the change: {0}")]
    Registry(RegistryError),
}

impl OrchestratorError {
    pub fn backend(backend: &str, source: BackendError) -> Self {
        OrchestratorError::Backend {
            backend: backend.to_string(),
            source,
        }
    }

    /// Whether the same call may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Backend { source, .. } => source.is_retryable(),
            OrchestratorError::NoAvailableBackend(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code for API bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "VALIDATION_ERROR",
            OrchestratorError::NoAvailableBackend(_) => "NO_AVAILABLE_BACKEND",
            OrchestratorError::Backend { source, .. } => source.code(),
            OrchestratorError::NotFound(_) => "NOT_FOUND",
            OrchestratorError::InvalidState { .. } => "INVALID_STATE",
            OrchestratorError::Registry(_) => "REGISTRY_ERROR",
        }
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Registry(other),
        }
    }
}
