use std::future::Future;
use std::sync::Arc;

use vmgrid_common::bus::InstanceEventType;
use vmgrid_common::InstanceRecord;
use vmgrid_providers::{BackendAdapter, BackendError};

use crate::config::Settings;
use crate::events::EventBus;
use crate::registry::InstanceRegistry;
use crate::selector::{BackendSelector, CallOutcome};
use crate::store::RecordStore;

/// State shared by the facade, the reconciler tasks and the sweeper.
pub struct Context {
    pub settings: Settings,
    pub registry: InstanceRegistry,
    pub selector: BackendSelector,
    pub store: Arc<dyn RecordStore>,
    pub events: EventBus,
}

impl Context {
    /// Mirrors a committed snapshot and announces it.
    ///
    /// The registry stays authoritative: a failed mirror write is logged and
    /// the next committed revision overwrites it.
    pub async fn committed(&self, record: &InstanceRecord, event: InstanceEventType) {
        if let Err(e) = self.store.upsert(record).await {
            tracing::warn!(
                instance_id = %record.id,
                revision = record.revision,
                error = %e,
                "record mirror write failed"
            );
        }
        self.events.publish(event, record);
    }

    /// Runs one adapter call under the per-call timeout and feeds its outcome
    /// into backend health.
    pub async fn call<T, F>(&self, backend: &str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let limit = self.settings.call_timeout;
        let result = match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        };
        self.selector.record_outcome(backend, CallOutcome::of(&result));
        result
    }

    pub fn ssh_user_for(&self, adapter: &dyn BackendAdapter) -> Option<String> {
        self.settings
            .overrides_for(adapter.name())
            .ssh_user
            .or_else(|| adapter.default_ssh_user().map(|u| u.to_string()))
    }

    pub fn require_public_ip(&self, backend: &str) -> bool {
        self.settings.overrides_for(backend).require_public_ip
    }
}
