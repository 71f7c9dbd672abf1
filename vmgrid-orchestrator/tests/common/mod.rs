// Common test utilities and fixtures
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use vmgrid_common::{CreateInstanceRequest, InstanceRecord, InstanceState};
use vmgrid_orchestrator::{MemoryStore, Orchestrator, Settings};
use vmgrid_providers::mock::MockBackend;
use vmgrid_providers::BackendAdapter;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub backend: Arc<MockBackend>,
    pub store: Arc<MemoryStore>,
}

pub fn settings() -> Settings {
    Settings {
        backends: vec!["mock".to_string()],
        ..Settings::default()
    }
}

/// One mock backend named "mock" behind a fresh orchestrator.
pub fn harness(backend: MockBackend) -> Harness {
    harness_with(settings(), backend, Arc::new(MemoryStore::new()))
}

pub fn harness_with(settings: Settings, backend: MockBackend, store: Arc<MemoryStore>) -> Harness {
    let backend = Arc::new(backend);
    let orchestrator = Orchestrator::new(
        settings,
        vec![backend.clone() as Arc<dyn BackendAdapter>],
        store.clone(),
    )
    .expect("orchestrator");
    Harness {
        orchestrator,
        backend,
        store,
    }
}

pub fn request(name: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        name: name.to_string(),
        ami: "ubuntu-22.04".to_string(),
        instance_type: "small".to_string(),
        storage_gb: 20,
        backend: None,
    }
}

/// Polls the registry until the record reaches `state`, with a virtual-time cap.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    id: Uuid,
    state: InstanceState,
) -> InstanceRecord {
    let deadline = Instant::now() + Duration::from_secs(3600);
    loop {
        let record = orchestrator.get_instance(id, false).await.expect("record");
        if record.state == state {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "instance {} stuck in {} while waiting for {}",
            id,
            record.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Lets background tasks run for `secs` of virtual time.
pub async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}
