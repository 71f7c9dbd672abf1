use async_trait::async_trait;
use std::time::Duration;

/// Uniform capability set every compute backend implements.
///
/// Adapters are stateless translators: they never keep instance records, only
/// backend-native identifiers handed back by `create`.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier, stored as `backend_used` on every record.
    fn name(&self) -> &str;

    /// Issues the provisioning call and returns the backend-native id.
    ///
    /// There is no idempotency key: a caller may only retry when the error's
    /// [`BackendError::creation_outcome`] is [`CreationOutcome::NotCreated`].
    async fn create(&self, spec: &CreateSpec) -> Result<String, BackendError>;

    async fn describe(&self, backend_instance_id: &str) -> Result<InstanceObservation, BackendError>;

    /// Must succeed as a no-op when the instance is already gone.
    async fn terminate(&self, backend_instance_id: &str) -> Result<(), BackendError>;

    // For reconciliation against the backend's own inventory
    async fn list(&self) -> Result<Vec<inventory::DiscoveredInstance>, BackendError>;

    // Optional: login user for images of this backend.
    // Default returns None (no SSH string is derived).
    fn default_ssh_user(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub ami: String,
    pub instance_type: String,
    pub storage_gb: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Booting,
    Running,
    Failed,
    NotFound,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Booting => "booting",
            BackendStatus::Running => "running",
            BackendStatus::Failed => "failed",
            BackendStatus::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceObservation {
    pub status: BackendStatus,
    pub public_ip: Option<String>,
}

impl InstanceObservation {
    pub fn new(status: BackendStatus, public_ip: Option<String>) -> Self {
        Self { status, public_ip }
    }

    pub fn not_found() -> Self {
        Self::new(BackendStatus::NotFound, None)
    }
}

/// What is known about resources after a failed `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationOutcome {
    /// Nothing was created, retrying is safe.
    NotCreated,
    /// The backend refused the request; retrying will not help.
    ConfirmedFailed,
    /// The request may have created an instance; look for orphans before retrying.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Network or API hiccup; the call can be retried.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Quota, validation or permission errors.
    #[error("backend rejected the request: {0}")]
    Rejected(String),

    /// The create request may or may not have been applied.
    #[error("backend outcome unconfirmed: {0}")]
    Unconfirmed(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }

    pub fn creation_outcome(&self) -> CreationOutcome {
        match self {
            BackendError::Transient(_) => CreationOutcome::NotCreated,
            BackendError::Rejected(_) => CreationOutcome::ConfirmedFailed,
            BackendError::Unconfirmed(_) | BackendError::Timeout(_) => CreationOutcome::Unknown,
        }
    }

    /// Short machine-readable code, used as the failed record's reason.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Transient(_) => "BACKEND_TRANSIENT",
            BackendError::Rejected(_) => "BACKEND_REJECTED",
            BackendError::Unconfirmed(_) => "BACKEND_UNCONFIRMED",
            BackendError::Timeout(_) => "BACKEND_TIMEOUT",
        }
    }
}

pub mod inventory {
    #[derive(Clone, Debug)]
    pub struct DiscoveredInstance {
        pub backend_instance_id: String,
        pub name: String,
        pub status: String,
        pub ip_address: Option<String>,
        pub created_at: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "scaleway")]
pub mod scaleway;
