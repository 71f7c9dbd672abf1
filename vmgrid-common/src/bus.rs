use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{InstanceRecord, InstanceState};

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_INSTANCE_EVENTS: &str = "instance_events";

// -----------------------------------------------------------------------------
// Lifecycle events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEventType {
    #[serde(rename = "EVT:INSTANCE_CREATED")]
    Created,
    #[serde(rename = "EVT:INSTANCE_RUNNING")]
    Running,
    #[serde(rename = "EVT:INSTANCE_FAILED")]
    Failed,
    #[serde(rename = "EVT:INSTANCE_TERMINATING")]
    Terminating,
    #[serde(rename = "EVT:INSTANCE_TERMINATED")]
    Terminated,
    #[serde(rename = "EVT:INSTANCE_UPDATED")]
    Updated,
}

impl InstanceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceEventType::Created => "EVT:INSTANCE_CREATED",
            InstanceEventType::Running => "EVT:INSTANCE_RUNNING",
            InstanceEventType::Failed => "EVT:INSTANCE_FAILED",
            InstanceEventType::Terminating => "EVT:INSTANCE_TERMINATING",
            InstanceEventType::Terminated => "EVT:INSTANCE_TERMINATED",
            InstanceEventType::Updated => "EVT:INSTANCE_UPDATED",
        }
    }

    /// Event emitted when a record enters `state`.
    pub fn for_state(state: InstanceState) -> Self {
        match state {
            InstanceState::Pending => InstanceEventType::Created,
            InstanceState::Running => InstanceEventType::Running,
            InstanceState::Failed => InstanceEventType::Failed,
            InstanceState::Terminating => InstanceEventType::Terminating,
            InstanceState::Terminated => InstanceEventType::Terminated,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceEventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: InstanceEventType,
    pub occurred_at: DateTime<Utc>,
    pub instance_id: Uuid,
    pub backend: String,
    pub state: InstanceState,
    /// Revision of the record snapshot. Delivery order is not guaranteed across
    /// writers; order events of one instance by this field.
    pub revision: i64,
    pub payload: serde_json::Value,
    pub source: String,
}

impl InstanceEventEnvelope {
    pub fn new(event_type: InstanceEventType, record: &InstanceRecord, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            instance_id: record.id,
            backend: record.backend_used.clone(),
            state: record.state,
            revision: record.revision,
            payload: serde_json::json!({
                "name": record.name,
                "public_ip": record.public_ip,
                "backend_instance_id": record.backend_instance_id,
                "error_code": record.error_code,
                "error_message": record.error_message,
            }),
            source: source.to_string(),
        }
    }
}
