use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use vmgrid_common::{InstanceRecord, InstanceState};
use vmgrid_providers::{BackendError, BackendStatus};

use crate::backoff::PollBackoff;
use crate::context::Context;
use crate::logger;
use crate::state_machine;

pub const BOOT_TIMEOUT: &str = "BOOT_TIMEOUT";
pub const BACKEND_FAILED: &str = "BACKEND_FAILED";
pub const BACKEND_NOT_FOUND: &str = "BACKEND_NOT_FOUND";
pub const BACKEND_UNAVAILABLE: &str = "BACKEND_UNAVAILABLE";
pub const TERMINATION_FAILED: &str = "TERMINATION_FAILED";
pub const TERMINATION_TIMEOUT: &str = "TERMINATION_TIMEOUT";

type TaskKey = (Uuid, InstanceState);

/// Drives `pending` and `terminating` records to a settled state.
///
/// Each record gets its own task per phase; the active set guarantees at most
/// one task per (record, phase) no matter how often `attach` is called.
#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<Context>,
    active: Arc<Mutex<HashSet<TaskKey>>>,
}

struct TaskGuard {
    active: Arc<Mutex<HashSet<TaskKey>>>,
    key: TaskKey,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Starts a reconciliation task for `record` unless one is already running.
    /// Returns whether a task was spawned.
    pub fn attach(&self, record: &InstanceRecord) -> bool {
        if !record.state.needs_reconciliation() {
            return false;
        }
        let key = (record.id, record.state);
        if !self.active.lock().insert(key) {
            return false;
        }
        let guard = TaskGuard {
            active: self.active.clone(),
            key,
        };

        let ctx = self.ctx.clone();
        let instance_id = record.id;
        if record.state == InstanceState::Pending {
            tokio::spawn(async move {
                let _guard = guard;
                drive_provisioning(&ctx, instance_id).await;
            });
        } else {
            tokio::spawn(async move {
                let _guard = guard;
                drive_termination(&ctx, instance_id).await;
            });
        }
        true
    }

    pub fn is_active(&self, instance_id: Uuid, state: InstanceState) -> bool {
        self.active.lock().contains(&(instance_id, state))
    }

    pub fn active_tasks(&self) -> usize {
        self.active.lock().len()
    }
}

/// Thirty years, the same horizon tokio uses for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn remaining_budget(since: DateTime<Utc>, budget: Duration) -> Instant {
    let elapsed = (Utc::now() - since).to_std().unwrap_or(Duration::ZERO);
    let now = Instant::now();
    now.checked_add(budget.saturating_sub(elapsed))
        .unwrap_or_else(|| now + FAR_FUTURE)
}

fn current(ctx: &Context, instance_id: Uuid, expected: InstanceState) -> Option<InstanceRecord> {
    ctx.registry
        .get(instance_id)
        .filter(|record| record.state == expected)
}

/// Sleeps for the next backoff delay, never past `deadline`.
/// Returns false once the deadline has been reached.
async fn wait_next_poll(backoff: &mut PollBackoff, deadline: Instant) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    let delay = backoff.next_delay().min(deadline - now);
    tokio::time::sleep(delay).await;
    true
}

fn with_last_error(message: String, last_error: Option<&BackendError>) -> String {
    match last_error {
        Some(e) => format!("{message} (last error: {e})"),
        None => message,
    }
}

async fn fail_pending(ctx: &Context, instance_id: Uuid, code: &str, message: &str) {
    if let Err(e) = state_machine::pending_to_failed(ctx, instance_id, code, message).await {
        tracing::error!(%instance_id, error = %e, "pending_to_failed rejected");
    }
}

async fn fail_terminating(ctx: &Context, instance_id: Uuid, code: &str, message: &str) {
    if let Err(e) = state_machine::terminating_to_failed(ctx, instance_id, code, message).await {
        tracing::error!(%instance_id, error = %e, "terminating_to_failed rejected");
    }
}

/// Polls a pending instance until it is reachable, fails, or runs out of boot budget.
async fn drive_provisioning(ctx: &Context, instance_id: Uuid) {
    let Some(record) = current(ctx, instance_id, InstanceState::Pending) else {
        return;
    };
    let backend = record.backend_used.clone();
    let Some(adapter) = ctx.selector.adapter(&backend) else {
        fail_pending(
            ctx,
            instance_id,
            BACKEND_UNAVAILABLE,
            &format!("backend {backend} is not registered"),
        )
        .await;
        return;
    };

    let ssh_user = ctx.ssh_user_for(adapter.as_ref());
    let require_ip = ctx.require_public_ip(&backend);
    let budget = ctx.settings.poll.max_boot_wait;
    let deadline = remaining_budget(record.created_at, budget);
    let mut backoff = PollBackoff::new(&ctx.settings.poll);
    let mut last_error: Option<BackendError> = None;
    let mut polls = 0u32;

    let action = logger::log_event_with_metadata(
        "RECONCILE_PROVISIONING",
        Some(instance_id),
        Some(serde_json::json!({
            "backend": backend,
            "backend_instance_id": record.backend_instance_id,
        })),
    );
    tracing::info!(%instance_id, backend = %backend, "waiting for instance to boot");

    loop {
        if current(ctx, instance_id, InstanceState::Pending).is_none() {
            action.complete("cancelled", None);
            return;
        }

        polls += 1;
        match ctx
            .call(&backend, adapter.describe(&record.backend_instance_id))
            .await
        {
            Ok(obs) => {
                tracing::debug!(%instance_id, status = obs.status.as_str(), polls, "describe");
                match obs.status {
                    BackendStatus::Running if obs.public_ip.is_some() || !require_ip => {
                        let result = state_machine::pending_to_running(
                            ctx,
                            instance_id,
                            obs.public_ip,
                            ssh_user.as_deref(),
                            "backend_running",
                        )
                        .await;
                        if let Err(e) = result {
                            tracing::error!(%instance_id, error = %e, "pending_to_running rejected");
                        }
                        action.complete_with_metadata(
                            "success",
                            None,
                            Some(serde_json::json!({ "polls": polls })),
                        );
                        return;
                    }
                    BackendStatus::Running | BackendStatus::Booting => {}
                    BackendStatus::Failed => {
                        let message = "backend reports the instance as failed";
                        fail_pending(ctx, instance_id, BACKEND_FAILED, message).await;
                        action.complete("failed", Some(message));
                        return;
                    }
                    BackendStatus::NotFound => {
                        let message = "instance disappeared from the backend while booting";
                        fail_pending(ctx, instance_id, BACKEND_NOT_FOUND, message).await;
                        action.complete("failed", Some(message));
                        return;
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(%instance_id, backend = %backend, error = %e, "describe failed, will retry");
                last_error = Some(e);
            }
            Err(e) => {
                let message = e.to_string();
                fail_pending(ctx, instance_id, e.code(), &message).await;
                action.complete("failed", Some(&message));
                return;
            }
        }

        if !wait_next_poll(&mut backoff, deadline).await {
            let message = with_last_error(
                format!("instance not reachable within {}s", budget.as_secs()),
                last_error.as_ref(),
            );
            fail_pending(ctx, instance_id, BOOT_TIMEOUT, &message).await;
            action.complete("failed", Some(&message));
            return;
        }
    }
}

/// Issues terminate and polls until the backend no longer knows the instance.
async fn drive_termination(ctx: &Context, instance_id: Uuid) {
    let Some(record) = current(ctx, instance_id, InstanceState::Terminating) else {
        return;
    };
    let backend = record.backend_used.clone();
    let Some(adapter) = ctx.selector.adapter(&backend) else {
        fail_terminating(
            ctx,
            instance_id,
            BACKEND_UNAVAILABLE,
            &format!("backend {backend} is not registered"),
        )
        .await;
        return;
    };

    let bid = record.backend_instance_id.clone();
    let budget = ctx.settings.poll.max_terminate_wait;
    let deadline = remaining_budget(record.updated_at, budget);
    let reissue_after = ctx.settings.poll.reissue_terminate_after.max(1);
    let mut backoff = PollBackoff::new(&ctx.settings.poll);
    let mut last_error: Option<BackendError> = None;
    let mut issued = false;
    let mut reissued = false;
    let mut still_present = 0u32;

    let action = logger::log_event_with_metadata(
        "RECONCILE_TERMINATION",
        Some(instance_id),
        Some(serde_json::json!({ "backend": backend, "backend_instance_id": bid })),
    );

    loop {
        if current(ctx, instance_id, InstanceState::Terminating).is_none() {
            action.complete("cancelled", None);
            return;
        }

        if !issued {
            match ctx.call(&backend, adapter.terminate(&bid)).await {
                Ok(()) => {
                    tracing::info!(%instance_id, backend = %backend, "terminate issued");
                    issued = true;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(%instance_id, error = %e, "terminate failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => {
                    let message = e.to_string();
                    fail_terminating(ctx, instance_id, TERMINATION_FAILED, &message).await;
                    action.complete("failed", Some(&message));
                    return;
                }
            }
        }

        if issued {
            match ctx.call(&backend, adapter.describe(&bid)).await {
                Ok(obs) if obs.status == BackendStatus::NotFound => {
                    if let Err(e) =
                        state_machine::terminating_to_terminated(ctx, instance_id, "backend_gone")
                            .await
                    {
                        tracing::error!(%instance_id, error = %e, "terminating_to_terminated rejected");
                    }
                    action.complete("success", None);
                    return;
                }
                Ok(obs) => {
                    still_present += 1;
                    tracing::debug!(%instance_id, status = obs.status.as_str(), still_present, "still present");
                    if !reissued && still_present >= reissue_after {
                        reissued = true;
                        tracing::info!(%instance_id, "instance still present, re-issuing terminate");
                        match ctx.call(&backend, adapter.terminate(&bid)).await {
                            Ok(()) => {}
                            Err(e) if e.is_retryable() => last_error = Some(e),
                            Err(e) => {
                                let message = e.to_string();
                                fail_terminating(ctx, instance_id, TERMINATION_FAILED, &message)
                                    .await;
                                action.complete("failed", Some(&message));
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(%instance_id, error = %e, "describe failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => {
                    let message = e.to_string();
                    fail_terminating(ctx, instance_id, TERMINATION_FAILED, &message).await;
                    action.complete("failed", Some(&message));
                    return;
                }
            }
        }

        if !wait_next_poll(&mut backoff, deadline).await {
            let message = with_last_error(
                format!("instance still present after {}s", budget.as_secs()),
                last_error.as_ref(),
            );
            fail_terminating(ctx, instance_id, TERMINATION_TIMEOUT, &message).await;
            action.complete("failed", Some(&message));
            return;
        }
    }
}
