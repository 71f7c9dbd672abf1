use chrono::Utc;
use uuid::Uuid;
use vmgrid_common::bus::InstanceEventType;
use vmgrid_common::{InstanceRecord, InstanceState};

use crate::context::Context;
use crate::logger;
use crate::registry::RegistryError;

/// Guarded transition: applies only while the record is in one of `from`.
///
/// Returns `Ok(None)` when the record already left those states, which makes
/// every transition below idempotent.
async fn transition<F>(
    ctx: &Context,
    instance_id: Uuid,
    from: &[InstanceState],
    to: InstanceState,
    reason: &str,
    apply: F,
) -> Result<Option<InstanceRecord>, RegistryError>
where
    F: FnOnce(&mut InstanceRecord),
{
    let mut prev = None;
    let updated = ctx.registry.update(instance_id, |record| {
        if !from.contains(&record.state) {
            return None;
        }
        prev = Some(record.state);
        record.state = to;
        apply(record);
        Some(())
    })?;

    match (updated, prev) {
        (Some(record), Some(prev)) => {
            logger::log_state_transition(instance_id, prev.as_str(), to.as_str(), reason);
            ctx.committed(&record, InstanceEventType::for_state(to)).await;
            Ok(Some(record))
        }
        _ => {
            tracing::debug!(
                %instance_id,
                to = to.as_str(),
                "transition skipped, record already moved on"
            );
            Ok(None)
        }
    }
}

/// Transition PENDING -> RUNNING (idempotent).
pub async fn pending_to_running(
    ctx: &Context,
    instance_id: Uuid,
    public_ip: Option<String>,
    ssh_user: Option<&str>,
    reason: &str,
) -> Result<Option<InstanceRecord>, RegistryError> {
    transition(
        ctx,
        instance_id,
        &[InstanceState::Pending],
        InstanceState::Running,
        reason,
        |record| {
            record.set_public_ip(public_ip, ssh_user);
            record.error_code = None;
            record.error_message = None;
        },
    )
    .await
}

/// Transition PENDING -> FAILED (idempotent) + logs the failure.
pub async fn pending_to_failed(
    ctx: &Context,
    instance_id: Uuid,
    error_code: &str,
    error_message: &str,
) -> Result<Option<InstanceRecord>, RegistryError> {
    let failed = transition(
        ctx,
        instance_id,
        &[InstanceState::Pending],
        InstanceState::Failed,
        error_code,
        |record| {
            record.error_code = Some(error_code.to_string());
            record.error_message = Some(error_message.to_string());
            record.failed_at = Some(Utc::now());
        },
    )
    .await?;
    if failed.is_some() {
        logger::log_event("INSTANCE_STARTUP_FAILED", "failed", Some(instance_id), Some(error_message));
    }
    Ok(failed)
}

/// Transition RUNNING -> TERMINATING (idempotent).
pub async fn running_to_terminating(
    ctx: &Context,
    instance_id: Uuid,
    reason: &str,
) -> Result<Option<InstanceRecord>, RegistryError> {
    transition(
        ctx,
        instance_id,
        &[InstanceState::Running],
        InstanceState::Terminating,
        reason,
        |_| {},
    )
    .await
}

/// Transition TERMINATING -> TERMINATED (idempotent).
pub async fn terminating_to_terminated(
    ctx: &Context,
    instance_id: Uuid,
    reason: &str,
) -> Result<Option<InstanceRecord>, RegistryError> {
    transition(
        ctx,
        instance_id,
        &[InstanceState::Terminating],
        InstanceState::Terminated,
        reason,
        |record| {
            record.terminated_at = Some(Utc::now());
        },
    )
    .await
}

/// Transition TERMINATING -> FAILED (idempotent). The last known address is kept.
pub async fn terminating_to_failed(
    ctx: &Context,
    instance_id: Uuid,
    error_code: &str,
    error_message: &str,
) -> Result<Option<InstanceRecord>, RegistryError> {
    let failed = transition(
        ctx,
        instance_id,
        &[InstanceState::Terminating],
        InstanceState::Failed,
        error_code,
        |record| {
            record.error_code = Some(error_code.to_string());
            record.error_message = Some(error_message.to_string());
            record.failed_at = Some(Utc::now());
        },
    )
    .await?;
    if failed.is_some() {
        logger::log_event("INSTANCE_TERMINATION_FAILED", "failed", Some(instance_id), Some(error_message));
    }
    Ok(failed)
}

/// Picks up an address change reported for a RUNNING instance.
pub async fn refresh_public_ip(
    ctx: &Context,
    instance_id: Uuid,
    public_ip: String,
    ssh_user: Option<&str>,
) -> Result<Option<InstanceRecord>, RegistryError> {
    let updated = ctx.registry.update(instance_id, |record| {
        if record.state != InstanceState::Running || record.public_ip.as_deref() == Some(public_ip.as_str()) {
            return None;
        }
        record.set_public_ip(Some(public_ip.clone()), ssh_user);
        Some(())
    })?;
    if let Some(record) = &updated {
        tracing::info!(%instance_id, public_ip = %public_ip, "public address changed");
        ctx.committed(record, InstanceEventType::Updated).await;
    }
    Ok(updated)
}

/// Attaches a diagnostic to a RUNNING record without changing its state.
pub async fn note_backend_error(
    ctx: &Context,
    instance_id: Uuid,
    error_code: &str,
    error_message: &str,
) -> Result<Option<InstanceRecord>, RegistryError> {
    let updated = ctx.registry.update(instance_id, |record| {
        if record.state != InstanceState::Running
            || record.error_code.as_deref() == Some(error_code)
        {
            return None;
        }
        record.error_code = Some(error_code.to_string());
        record.error_message = Some(error_message.to_string());
        Some(())
    })?;
    if let Some(record) = &updated {
        tracing::warn!(%instance_id, error_code, error_message, "backend reported a problem");
        ctx.committed(record, InstanceEventType::Updated).await;
    }
    Ok(updated)
}
