use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use vmgrid_common::bus::{InstanceEventEnvelope, InstanceEventType};
use vmgrid_common::{CreateInstanceRequest, InstanceRecord, InstanceState, ListInstancesResponse};
use vmgrid_providers::inventory::DiscoveredInstance;
use vmgrid_providers::{BackendAdapter, BackendStatus, CreateSpec, CreationOutcome};

use crate::config::Settings;
use crate::context::Context;
use crate::error::OrchestratorError;
use crate::events::EventBus;
use crate::logger;
use crate::reconciler::Reconciler;
use crate::registry::{InstanceRegistry, RegistryError};
use crate::selector::{BackendHealth, BackendSelector};
use crate::state_machine;
use crate::store::RecordStore;

pub const BACKEND_REPORTED_FAILED: &str = "BACKEND_REPORTED_FAILED";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub attached: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub reattached: usize,
}

#[derive(Debug, Clone)]
pub struct Orphan {
    pub backend: String,
    pub instance: DiscoveredInstance,
}

/// Entry point for every caller: HTTP handlers, jobs and tests.
///
/// Cheap to clone; all clones share one registry and one reconciler.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<Context>,
    reconciler: Reconciler,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        adapters: Vec<Arc<dyn BackendAdapter>>,
        store: Arc<dyn RecordStore>,
    ) -> anyhow::Result<Self> {
        let selector = BackendSelector::new(
            adapters,
            settings.backends.clone(),
            settings.unhealthy_threshold,
            settings.unhealthy_cooldown,
        )?;
        let events = EventBus::new(settings.event_capacity);
        let ctx = Arc::new(Context {
            settings,
            registry: InstanceRegistry::new(),
            selector,
            store,
            events,
        });
        Ok(Self {
            reconciler: Reconciler::new(ctx.clone()),
            ctx,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEventEnvelope> {
        self.ctx.events.subscribe()
    }

    pub fn backend_health(&self) -> Vec<BackendHealth> {
        self.ctx.selector.health_snapshot()
    }

    /// Validates, picks a backend and issues the create call.
    ///
    /// The returned record is always `pending`; the reconciler takes it from
    /// there. No record exists when the backend call fails.
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<InstanceRecord, OrchestratorError> {
        request.validate()?;

        let adapter = self.ctx.selector.select(request.backend.as_deref())?;
        let backend = adapter.name().to_string();
        let spec = CreateSpec {
            name: request.name.clone(),
            ami: request.ami.clone(),
            instance_type: request.instance_type.clone(),
            storage_gb: request.storage_gb,
        };

        let action = logger::log_event_with_metadata(
            "CREATE_INSTANCE",
            None,
            Some(serde_json::json!({
                "backend": backend,
                "name": request.name,
                "instance_type": request.instance_type,
            })),
        );

        let backend_instance_id = match self.ctx.call(&backend, adapter.create(&spec)).await {
            Ok(id) => id,
            Err(e) => {
                if e.creation_outcome() == CreationOutcome::Unknown {
                    tracing::warn!(
                        backend = %backend,
                        name = %request.name,
                        error = %e,
                        "create outcome unknown, the backend may hold an orphaned instance"
                    );
                }
                action.complete("failed", Some(&e.to_string()));
                return Err(OrchestratorError::backend(&backend, e));
            }
        };

        let record = InstanceRecord::pending(
            Uuid::new_v4(),
            &request,
            &backend,
            backend_instance_id,
            Utc::now(),
        );
        self.ctx.registry.insert(record.clone())?;
        action
            .with_instance(record.id)
            .complete_with_metadata(
                "success",
                None,
                Some(serde_json::json!({ "backend_instance_id": record.backend_instance_id })),
            );

        self.ctx.committed(&record, InstanceEventType::Created).await;
        self.reconciler.attach(&record);
        Ok(record)
    }

    /// Current snapshot. With `refresh`, a running record is first checked
    /// against the backend; refresh problems are logged, never returned.
    pub async fn get_instance(
        &self,
        instance_id: Uuid,
        refresh: bool,
    ) -> Result<InstanceRecord, OrchestratorError> {
        let record = self
            .ctx
            .registry
            .get(instance_id)
            .ok_or(OrchestratorError::NotFound(instance_id))?;
        if !refresh || record.state != InstanceState::Running {
            return Ok(record);
        }
        Ok(self.refresh_running(record).await)
    }

    async fn refresh_running(&self, record: InstanceRecord) -> InstanceRecord {
        let ctx = &self.ctx;
        let Some(adapter) = ctx.selector.adapter(&record.backend_used) else {
            return record;
        };
        let observation = match ctx
            .call(&record.backend_used, adapter.describe(&record.backend_instance_id))
            .await
        {
            Ok(obs) => obs,
            Err(e) => {
                tracing::warn!(instance_id = %record.id, error = %e, "refresh failed, serving cached record");
                return record;
            }
        };

        let result = match observation.status {
            BackendStatus::NotFound => {
                tracing::warn!(instance_id = %record.id, "instance deleted outside the orchestrator");
                let moved =
                    state_machine::running_to_terminating(ctx, record.id, "backend_deleted").await;
                if let Ok(Some(terminating)) = &moved {
                    self.reconciler.attach(terminating);
                }
                moved
            }
            BackendStatus::Failed => {
                state_machine::note_backend_error(
                    ctx,
                    record.id,
                    BACKEND_REPORTED_FAILED,
                    "backend reports the instance as failed",
                )
                .await
            }
            BackendStatus::Running | BackendStatus::Booting => match observation.public_ip {
                Some(ip) => {
                    let ssh_user = ctx.ssh_user_for(adapter.as_ref());
                    state_machine::refresh_public_ip(ctx, record.id, ip, ssh_user.as_deref()).await
                }
                None => Ok(None),
            },
        };

        match result {
            Ok(Some(updated)) => updated,
            Ok(None) => ctx.registry.get(record.id).unwrap_or(record),
            Err(e) => {
                tracing::warn!(instance_id = %record.id, error = %e, "refresh update rejected");
                ctx.registry.get(record.id).unwrap_or(record)
            }
        }
    }

    /// Every record in creation order, served from memory.
    pub fn list_instances(&self) -> ListInstancesResponse {
        ListInstancesResponse {
            instances: self.ctx.registry.list(),
        }
    }

    /// Starts termination of a running instance.
    ///
    /// Repeating the call on a terminating or terminated record returns it
    /// unchanged without another backend call.
    pub async fn terminate_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<InstanceRecord, OrchestratorError> {
        let record = self
            .ctx
            .registry
            .get(instance_id)
            .ok_or(OrchestratorError::NotFound(instance_id))?;

        if record.state == InstanceState::Running {
            if let Some(updated) =
                state_machine::running_to_terminating(&self.ctx, instance_id, "requested").await?
            {
                logger::log_event("TERMINATE_INSTANCE", "success", Some(instance_id), None);
                self.reconciler.attach(&updated);
                return Ok(updated);
            }
        }

        // Lost a race or called again: decide on the current state.
        let record = self
            .ctx
            .registry
            .get(instance_id)
            .ok_or(OrchestratorError::NotFound(instance_id))?;
        match record.state {
            InstanceState::Terminating => {
                self.reconciler.attach(&record);
                Ok(record)
            }
            InstanceState::Terminated => Ok(record),
            state => Err(OrchestratorError::InvalidState {
                id: instance_id,
                state,
                operation: "terminate",
            }),
        }
    }

    /// Reloads mirrored records and resumes reconciliation of in-flight ones.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let records = self.ctx.store.load_all().await?;
        let mut report = RecoveryReport::default();
        for record in records {
            match self.ctx.registry.insert(record.clone()) {
                Ok(()) => report.loaded += 1,
                Err(RegistryError::DuplicateId(_)) => continue,
                Err(e) => {
                    tracing::warn!(instance_id = %record.id, error = %e, "skipping unloadable record");
                    continue;
                }
            }
            if self.reconciler.attach(&record) {
                report.attached += 1;
            }
        }
        tracing::info!(loaded = report.loaded, attached = report.attached, "records recovered");
        Ok(report)
    }

    /// Drops terminal records past retention and re-attaches in-flight
    /// records whose task is gone.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let retention = self
            .ctx
            .settings
            .retention
            .and_then(|r| chrono::Duration::from_std(r).ok());
        let now = Utc::now();

        for record in self.ctx.registry.list() {
            if let (Some(retention), Some(finished)) = (retention, record.finished_at()) {
                if now - finished >= retention {
                    self.ctx.registry.remove(record.id);
                    if let Err(e) = self.ctx.store.remove(record.id).await {
                        tracing::warn!(instance_id = %record.id, error = %e, "mirror delete failed");
                    }
                    report.removed += 1;
                    continue;
                }
            }
            if record.state.needs_reconciliation()
                && !self.reconciler.is_active(record.id, record.state)
                && self.reconciler.attach(&record)
            {
                tracing::warn!(instance_id = %record.id, state = %record.state, "re-attached orphaned record");
                report.reattached += 1;
            }
        }
        report
    }

    /// Backend instances tagged for this service that no record points at.
    pub async fn find_orphans(&self) -> Vec<Orphan> {
        let records = self.ctx.registry.list();
        let mut orphans = Vec::new();
        for adapter in self.ctx.selector.adapters() {
            let name = adapter.name();
            if !self.ctx.selector.is_healthy(name) {
                continue;
            }
            let known: HashSet<&str> = records
                .iter()
                .filter(|r| r.backend_used == name)
                .map(|r| r.backend_instance_id.as_str())
                .collect();
            match self.ctx.call(name, adapter.list()).await {
                Ok(found) => orphans.extend(
                    found
                        .into_iter()
                        .filter(|inst| !known.contains(inst.backend_instance_id.as_str()))
                        .map(|instance| Orphan {
                            backend: name.to_string(),
                            instance,
                        }),
                ),
                Err(e) => tracing::warn!(backend = name, error = %e, "inventory listing failed"),
            }
        }
        orphans
    }
}
