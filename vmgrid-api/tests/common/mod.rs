// Common test utilities and fixtures
#![allow(dead_code)]

use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use vmgrid_api::{build_app, AppState};
use vmgrid_orchestrator::config::PollPolicy;
use vmgrid_orchestrator::{BackendAdapter, MemoryStore, Orchestrator, Settings};
use vmgrid_providers::mock::MockBackend;

pub struct TestApp {
    pub server: TestServer,
    pub backend: Arc<MockBackend>,
}

/// Short polls so lifecycles finish in milliseconds of real time.
pub fn fast_settings() -> Settings {
    Settings {
        backends: vec!["mock".to_string()],
        poll: PollPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            ..PollPolicy::default()
        },
        ..Settings::default()
    }
}

pub fn test_app(backend: MockBackend) -> TestApp {
    let backend = Arc::new(backend);
    let orchestrator = Orchestrator::new(
        fast_settings(),
        vec![backend.clone() as Arc<dyn BackendAdapter>],
        Arc::new(MemoryStore::new()),
    )
    .expect("orchestrator");
    let server = TestServer::new(build_app(AppState::new(orchestrator))).expect("test server");
    TestApp { server, backend }
}

pub fn create_body(name: &str) -> Value {
    json!({
        "name": name,
        "ami": "ubuntu-22.04",
        "instance_type": "small",
        "storage_gb": 20
    })
}

/// Polls `GET /instances/{id}` until the record reports `state`.
pub async fn wait_for_state(server: &TestServer, id: &str, state: &str) -> Value {
    for _ in 0..200 {
        let body: Value = server.get(&format!("/instances/{id}")).await.json();
        if body["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {id} never reached {state}");
}
