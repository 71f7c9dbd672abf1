use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod bus;

// --- Enums ---

/// Lifecycle state of an instance record.
///
/// Allowed edges:
/// `pending -> running | failed`, `running -> terminating`,
/// `terminating -> terminated | failed`. `failed` and `terminated` are terminal.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema,
)]
#[sqlx(type_name = "instance_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,     // Create accepted by the backend, waiting for an address
    Running,     // Reachable (or settled without address when allowed)
    Failed,      // Terminal error state, see error_code
    Terminating, // Terminate issued, waiting for the backend to confirm
    Terminated,  // Gone on the backend
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Failed => "failed",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Terminated)
    }

    /// Records in these states are owned by a reconciliation task.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Terminating)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Terminating)
                | (Terminating, Terminated)
                | (Terminating, Failed)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown instance state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for InstanceState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InstanceState::Pending),
            "running" => Ok(InstanceState::Running),
            "failed" => Ok(InstanceState::Failed),
            "terminating" => Ok(InstanceState::Terminating),
            "terminated" => Ok(InstanceState::Terminated),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

// --- Requests ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct CreateInstanceRequest {
    pub name: String,
    /// Boot image reference.
    pub ami: String,
    pub instance_type: String,
    pub storage_gb: i64,
    /// Explicit backend hint. When absent the configured preference list decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

/// Every constraint violated by a create request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request: {}", render_fields(.fields))]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

fn render_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{} {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn single(field: &'static str, message: &'static str) -> Self {
        Self {
            fields: vec![FieldError { field, message }],
        }
    }
}

impl CreateInstanceRequest {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut fields = Vec::new();
        if self.name.is_empty() {
            fields.push(FieldError { field: "name", message: "must not be empty" });
        }
        if self.ami.is_empty() {
            fields.push(FieldError { field: "ami", message: "must not be empty" });
        }
        if self.instance_type.is_empty() {
            fields.push(FieldError { field: "instance_type", message: "must not be empty" });
        }
        if self.storage_gb < 1 {
            fields.push(FieldError { field: "storage_gb", message: "must be at least 1" });
        }
        if matches!(self.backend.as_deref(), Some("")) {
            fields.push(FieldError { field: "backend", message: "must not be empty when set" });
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors { fields })
        }
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "empty_string")]
    #[schema(value_type = String)]
    pub public_ip: Option<String>,
    /// Derived from `public_ip` and the backend's SSH user, never set on its own.
    #[serde(with = "empty_string")]
    #[schema(value_type = String)]
    pub ssh_string: Option<String>,
    pub state: InstanceState,
    pub ami: String,
    pub instance_type: String,
    pub storage_gb: i64,
    pub backend_used: String,
    /// Backend-native identifier used for describe/terminate calls.
    pub backend_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Bumped on every committed change; mirrors keep the highest revision.
    #[serde(default)]
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// A freshly created record, always `pending`.
    pub fn pending(
        id: Uuid,
        request: &CreateInstanceRequest,
        backend_used: &str,
        backend_instance_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: request.name.clone(),
            public_ip: None,
            ssh_string: None,
            state: InstanceState::Pending,
            ami: request.ami.clone(),
            instance_type: request.instance_type.clone(),
            storage_gb: request.storage_gb,
            backend_used: backend_used.to_string(),
            backend_instance_id,
            error_code: None,
            error_message: None,
            revision: 1,
            created_at: now,
            updated_at: now,
            terminated_at: None,
            failed_at: None,
        }
    }

    /// Sets the address and re-derives the SSH string in one step.
    pub fn set_public_ip(&mut self, ip: Option<String>, ssh_user: Option<&str>) {
        let ip = ip.filter(|s| !s.trim().is_empty());
        self.ssh_string = match (&ip, ssh_user) {
            (Some(ip), Some(user)) if !user.is_empty() => Some(format!("{}@{}", user, ip)),
            _ => None,
        };
        self.public_ip = ip;
    }

    /// When the record reached its terminal state, if it did.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            InstanceState::Terminated => self.terminated_at,
            InstanceState::Failed => self.failed_at,
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct ListInstancesResponse {
    /// Creation order.
    pub instances: Vec<InstanceRecord>,
}

/// `Option<String>` on the wire as a plain string, empty meaning absent.
mod empty_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.filter(|s| !s.is_empty()))
    }
}
