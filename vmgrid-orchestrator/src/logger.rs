use std::time::Instant;
use uuid::Uuid;

/// Action logger for the orchestrator.
///
/// Every action is an `in_progress` line followed by a completion line that
/// carries the duration, both under the `vmgrid::actions` target so they can
/// be filtered with `RUST_LOG=vmgrid::actions=info`.
#[must_use = "complete the action so its outcome and duration are logged"]
pub struct ActionLog {
    log_id: Uuid,
    action_type: &'static str,
    instance_id: Option<Uuid>,
    started: Instant,
}

pub fn log_event(
    action_type: &'static str,
    status: &str,
    instance_id: Option<Uuid>,
    error_message: Option<&str>,
) {
    emit(Uuid::new_v4(), action_type, status, instance_id, error_message, None, None);
}

/// Starts an action and returns the handle used to complete it.
pub fn log_event_with_metadata(
    action_type: &'static str,
    instance_id: Option<Uuid>,
    metadata: Option<serde_json::Value>,
) -> ActionLog {
    let log_id = Uuid::new_v4();
    emit(log_id, action_type, "in_progress", instance_id, None, None, metadata.as_ref());
    ActionLog {
        log_id,
        action_type,
        instance_id,
        started: Instant::now(),
    }
}

impl ActionLog {
    pub fn with_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn complete(self, status: &str, error_message: Option<&str>) {
        self.complete_with_metadata(status, error_message, None)
    }

    pub fn complete_with_metadata(
        self,
        status: &str,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        emit(
            self.log_id,
            self.action_type,
            status,
            self.instance_id,
            error_message,
            Some(duration_ms),
            metadata.as_ref(),
        );
    }
}

/// One line per committed lifecycle transition.
pub fn log_state_transition(instance_id: Uuid, from_status: &str, to_status: &str, reason: &str) {
    tracing::info!(
        target: "vmgrid::transitions",
        %instance_id,
        from = from_status,
        to = to_status,
        reason,
        "state transition"
    );
}

fn emit(
    log_id: Uuid,
    action_type: &str,
    status: &str,
    instance_id: Option<Uuid>,
    error_message: Option<&str>,
    duration_ms: Option<u64>,
    metadata: Option<&serde_json::Value>,
) {
    let instance_id = instance_id.map(|id| id.to_string());
    let metadata = metadata.map(|m| m.to_string());
    if status == "failed" {
        tracing::warn!(
            target: "vmgrid::actions",
            %log_id,
            action_type,
            status,
            instance_id = instance_id.as_deref(),
            error_message,
            duration_ms,
            metadata = metadata.as_deref(),
            "action"
        );
    } else {
        tracing::info!(
            target: "vmgrid::actions",
            %log_id,
            action_type,
            status,
            instance_id = instance_id.as_deref(),
            error_message,
            duration_ms,
            metadata = metadata.as_deref(),
            "action"
        );
    }
}
