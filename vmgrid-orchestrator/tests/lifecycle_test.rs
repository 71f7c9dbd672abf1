mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{harness, harness_with, request, settings, settle, wait_for_state};
use uuid::Uuid;
use vmgrid_common::bus::InstanceEventType;
use vmgrid_common::{InstanceRecord, InstanceState};
use vmgrid_orchestrator::config::BackendOverrides;
use vmgrid_orchestrator::store::RecordStore;
use vmgrid_orchestrator::{MemoryStore, Orchestrator, OrchestratorError, Settings};
use vmgrid_providers::mock::{BootBehavior, MockBackend};
use vmgrid_providers::{BackendAdapter, BackendError, CreateSpec};

fn spec(name: &str) -> CreateSpec {
    CreateSpec {
        name: name.to_string(),
        ami: "ubuntu-22.04".to_string(),
        instance_type: "small".to_string(),
        storage_gb: 20,
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_boots_to_running_with_ssh_string() {
    let h = harness(MockBackend::new("mock").with_public_ip("203.0.113.10"));

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    assert_eq!(created.state, InstanceState::Pending);
    assert_eq!(created.backend_used, "mock");
    assert_eq!(created.public_ip, None);
    assert_eq!(created.ssh_string, None);

    let running = wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;
    assert_eq!(running.public_ip.as_deref(), Some("203.0.113.10"));
    assert_eq!(running.ssh_string.as_deref(), Some("ubuntu@203.0.113.10"));
    assert_eq!(running.created_at, created.created_at);
    assert_eq!(h.backend.describe_calls(), 2);

    let mirrored = h.store.get(created.id).unwrap();
    assert_eq!(mirrored.state, InstanceState::Running);
    assert_eq!(mirrored.revision, running.revision);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_create_leaves_no_record() {
    let h = harness(MockBackend::new("mock"));
    h.backend
        .fail_next_create(BackendError::Rejected("quota exceeded".into()));

    let err = h.orchestrator.create_instance(request("web1")).await.unwrap_err();
    match &err {
        OrchestratorError::Backend { backend, source } => {
            assert_eq!(backend, "mock");
            assert_eq!(source, &BackendError::Rejected("quota exceeded".into()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_retryable());
    assert!(h.orchestrator.list_instances().instances.is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_never_reaches_backend() {
    let h = harness(MockBackend::new("mock"));

    let mut bad = request("web1");
    bad.storage_gb = 0;
    let err = h.orchestrator.create_instance(bad).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let mut unknown = request("web1");
    unknown.backend = Some("aws".into());
    let err = h.orchestrator.create_instance(unknown).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    assert_eq!(h.backend.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_boot_timeout_fails_the_record() {
    let h = harness(MockBackend::new("mock").with_boot_behavior(BootBehavior::StuckBooting));

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let failed = wait_for_state(&h.orchestrator, created.id, InstanceState::Failed).await;
    assert_eq!(failed.error_code.as_deref(), Some("BOOT_TIMEOUT"));
    assert_eq!(failed.public_ip, None);
    assert_eq!(failed.ssh_string, None);
    assert!(failed.failed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transient_describe_errors_are_retried() {
    let h = harness(MockBackend::new("mock"));
    h.backend.fail_next_describe(BackendError::Transient("503".into()));
    h.backend.fail_next_describe(BackendError::Transient("503".into()));

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let running = wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;
    assert!(running.public_ip.is_some());
    assert_eq!(h.backend.describe_calls(), 4);
    assert!(h.orchestrator.backend_health()[0].healthy);
}

#[tokio::test(start_paused = true)]
async fn test_backend_reported_failure_fails_the_record() {
    let h = harness(MockBackend::new("mock").with_boot_behavior(BootBehavior::Fails));

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let failed = wait_for_state(&h.orchestrator, created.id, InstanceState::Failed).await;
    assert_eq!(failed.error_code.as_deref(), Some("BACKEND_FAILED"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_address_keeps_pending_until_timeout() {
    let h = harness(MockBackend::new("mock").never_assign_ip());

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    settle(60).await;
    assert_eq!(
        h.orchestrator.get_instance(created.id, false).await.unwrap().state,
        InstanceState::Pending
    );
    let failed = wait_for_state(&h.orchestrator, created.id, InstanceState::Failed).await;
    assert_eq!(failed.error_code.as_deref(), Some("BOOT_TIMEOUT"));
}

#[tokio::test(start_paused = true)]
async fn test_address_optional_backend_settles_without_ip() {
    let mut settings = settings();
    settings.overrides.insert(
        "mock".to_string(),
        BackendOverrides {
            ssh_user: None,
            require_public_ip: false,
        },
    );
    let h = harness_with(
        settings,
        MockBackend::new("mock").never_assign_ip(),
        Arc::new(MemoryStore::new()),
    );

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let running = wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;
    assert_eq!(running.public_ip, None);
    assert_eq!(running.ssh_string, None);
}

#[tokio::test(start_paused = true)]
async fn test_configured_ssh_user_overrides_backend_default() {
    let mut settings = settings();
    settings.overrides.insert(
        "mock".to_string(),
        BackendOverrides {
            ssh_user: Some("admin".to_string()),
            require_public_ip: true,
        },
    );
    let h = harness_with(
        settings,
        MockBackend::new("mock").with_public_ip("198.51.100.4"),
        Arc::new(MemoryStore::new()),
    );

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let running = wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;
    assert_eq!(running.ssh_string.as_deref(), Some("admin@198.51.100.4"));
}

#[tokio::test(start_paused = true)]
async fn test_terminate_running_instance_and_repeat() {
    let h = harness(MockBackend::new("mock"));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    let terminating = h.orchestrator.terminate_instance(created.id).await.unwrap();
    assert_eq!(terminating.state, InstanceState::Terminating);

    let terminated = wait_for_state(&h.orchestrator, created.id, InstanceState::Terminated).await;
    assert!(terminated.terminated_at.is_some());
    assert_eq!(h.backend.terminate_calls(), 1);
    assert_eq!(h.backend.live_instances(), 0);

    let again = h.orchestrator.terminate_instance(created.id).await.unwrap();
    assert_eq!(again.state, InstanceState::Terminated);
    assert_eq!(h.backend.terminate_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_rejects_pending_failed_and_unknown() {
    let h = harness(MockBackend::new("mock").with_boot_behavior(BootBehavior::StuckBooting));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();

    let err = h.orchestrator.terminate_instance(created.id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidState { state: InstanceState::Pending, operation: "terminate", .. }
    ));

    wait_for_state(&h.orchestrator, created.id, InstanceState::Failed).await;
    let err = h.orchestrator.terminate_instance(created.id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidState { state: InstanceState::Failed, .. }
    ));

    let missing = Uuid::new_v4();
    let err = h.orchestrator.terminate_instance(missing).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(id) if id == missing));
    assert_eq!(h.backend.terminate_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_terminate_issues_one_backend_call() {
    let h = harness(MockBackend::new("mock"));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    let (a, b) = tokio::join!(
        h.orchestrator.terminate_instance(created.id),
        h.orchestrator.terminate_instance(created.id)
    );
    assert_eq!(a.unwrap().state, InstanceState::Terminating);
    assert_eq!(b.unwrap().state, InstanceState::Terminating);

    wait_for_state(&h.orchestrator, created.id, InstanceState::Terminated).await;
    assert_eq!(h.backend.terminate_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_teardown_reissues_terminate_once() {
    let h = harness(MockBackend::new("mock").with_terminate_polls(5));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    h.orchestrator.terminate_instance(created.id).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Terminated).await;
    assert_eq!(h.backend.terminate_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_terminate_fails_and_keeps_address() {
    let h = harness(MockBackend::new("mock").with_public_ip("203.0.113.77"));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    h.backend
        .fail_next_terminate(BackendError::Rejected("locked".into()));
    h.orchestrator.terminate_instance(created.id).await.unwrap();

    let failed = wait_for_state(&h.orchestrator, created.id, InstanceState::Failed).await;
    assert_eq!(failed.error_code.as_deref(), Some("TERMINATION_FAILED"));
    assert_eq!(failed.public_ip.as_deref(), Some("203.0.113.77"));
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_leaves_no_record() {
    let h = harness(MockBackend::new("mock").with_create_delay(Duration::from_secs(120)));

    let err = h.orchestrator.create_instance(request("web1")).await.unwrap_err();
    match err {
        OrchestratorError::Backend { source, .. } => {
            assert_eq!(source, BackendError::Timeout(Duration::from_secs(60)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.orchestrator.list_instances().instances.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_wait_budgets_do_not_break_reconciliation() {
    let mut settings = settings();
    settings.poll.max_boot_wait = Duration::MAX;
    settings.poll.max_terminate_wait = Duration::MAX;
    let h = harness_with(settings, MockBackend::new("mock"), Arc::new(MemoryStore::new()));

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;
    h.orchestrator.terminate_instance(created.id).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Terminated).await;
    settle(1).await;
    assert_eq!(h.orchestrator.reconciler().active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_backend_is_skipped() {
    let a = Arc::new(MockBackend::new("a"));
    let b = Arc::new(MockBackend::new("b"));
    let settings = Settings {
        backends: vec!["a".into(), "b".into()],
        ..Settings::default()
    };
    let orchestrator = Orchestrator::new(
        settings,
        vec![a.clone() as Arc<dyn BackendAdapter>, b.clone() as Arc<dyn BackendAdapter>],
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    for _ in 0..3 {
        a.fail_next_create(BackendError::Transient("connection reset".into()));
        let err = orchestrator.create_instance(request("web")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    let created = orchestrator.create_instance(request("web")).await.unwrap();
    assert_eq!(created.backend_used, "b");

    let health = orchestrator.backend_health();
    assert!(!health.iter().find(|h| h.name == "a").unwrap().healthy);
    assert!(health.iter().find(|h| h.name == "b").unwrap().healthy);
}

#[tokio::test(start_paused = true)]
async fn test_no_healthy_backend_is_reported() {
    let h = harness(MockBackend::new("mock"));
    for _ in 0..3 {
        h.backend
            .fail_next_create(BackendError::Transient("503".into()));
        let _ = h.orchestrator.create_instance(request("web")).await;
    }

    let err = h.orchestrator.create_instance(request("web")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoAvailableBackend(_)));

    // An explicit hint bypasses health.
    let mut hinted = request("web");
    hinted.backend = Some("mock".into());
    assert!(h.orchestrator.create_instance(hinted).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creates_get_distinct_records() {
    let h = harness(MockBackend::new("mock"));

    let mut creates = tokio::task::JoinSet::new();
    for i in 0..20 {
        let orchestrator = h.orchestrator.clone();
        creates.spawn(async move { orchestrator.create_instance(request(&format!("web{i}"))).await });
    }
    let mut created: Vec<InstanceRecord> = Vec::new();
    while let Some(joined) = creates.join_next().await {
        created.push(joined.unwrap().unwrap());
    }

    let mut ids: Vec<Uuid> = created.iter().map(|r| r.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);

    for record in &created {
        wait_for_state(&h.orchestrator, record.id, InstanceState::Running).await;
    }
    let listed = h.orchestrator.list_instances().instances;
    assert_eq!(listed.len(), 20);
    assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(h.orchestrator.reconciler().active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_the_lifecycle() {
    let h = harness(MockBackend::new("mock"));
    let mut rx = h.orchestrator.subscribe();

    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.event_type, InstanceEventType::Created);
    assert_eq!(first.instance_id, created.id);

    let second = rx.recv().await.unwrap();
    assert_eq!(second.event_type, InstanceEventType::Running);
    assert_eq!(second.state, InstanceState::Running);

    h.orchestrator.terminate_instance(created.id).await.unwrap();
    let third = rx.recv().await.unwrap();
    assert_eq!(third.event_type, InstanceEventType::Terminating);
    let fourth = rx.recv().await.unwrap();
    assert_eq!(fourth.event_type, InstanceEventType::Terminated);

    // Every event carries the revision of the snapshot it announces.
    let revisions = [first.revision, second.revision, third.revision, fourth.revision];
    assert_eq!(first.revision, created.revision);
    assert!(revisions.windows(2).all(|w| w[0] < w[1]), "{revisions:?}");
    let current = h.orchestrator.get_instance(created.id, false).await.unwrap();
    assert_eq!(fourth.revision, current.revision);
}

#[tokio::test(start_paused = true)]
async fn test_recover_resumes_pending_records() {
    let mock = MockBackend::new("mock");
    let backend_instance_id = mock.create(&spec("web1")).await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let pending = InstanceRecord::pending(
        Uuid::new_v4(),
        &request("web1"),
        "mock",
        backend_instance_id,
        Utc::now(),
    );
    store.upsert(&pending).await.unwrap();

    let h = harness_with(settings(), mock, store);
    let report = h.orchestrator.recover().await.unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.attached, 1);

    let running = wait_for_state(&h.orchestrator, pending.id, InstanceState::Running).await;
    assert!(running.public_ip.is_some());

    let again = h.orchestrator.recover().await.unwrap();
    assert_eq!(again.loaded, 0);
    assert_eq!(again.attached, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_detects_out_of_band_deletion() {
    let h = harness(MockBackend::new("mock"));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let running = wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    // Without refresh the cached record is served.
    h.backend.forget(&running.backend_instance_id);
    let cached = h.orchestrator.get_instance(created.id, false).await.unwrap();
    assert_eq!(cached.state, InstanceState::Running);

    let refreshed = h.orchestrator.get_instance(created.id, true).await.unwrap();
    assert_eq!(refreshed.state, InstanceState::Terminating);
    wait_for_state(&h.orchestrator, created.id, InstanceState::Terminated).await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_errors_serve_cached_record() {
    let h = harness(MockBackend::new("mock"));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let running = wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    h.backend
        .fail_next_describe(BackendError::Transient("timeout".into()));
    let refreshed = h.orchestrator.get_instance(created.id, true).await.unwrap();
    assert_eq!(refreshed, running);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_drops_expired_terminal_records() {
    let settings = Settings {
        retention: Some(Duration::ZERO),
        ..settings()
    };
    let h = harness_with(settings, MockBackend::new("mock"), Arc::new(MemoryStore::new()));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    let kept = h.orchestrator.create_instance(request("web2")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;
    wait_for_state(&h.orchestrator, kept.id, InstanceState::Running).await;
    h.orchestrator.terminate_instance(created.id).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Terminated).await;

    let report = h.orchestrator.sweep().await;
    assert_eq!(report.removed, 1);
    assert!(matches!(
        h.orchestrator.get_instance(created.id, false).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(h.store.get(created.id).is_none());
    assert_eq!(h.orchestrator.list_instances().instances.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_find_orphans_reports_unknown_backend_instances() {
    let h = harness(MockBackend::new("mock"));
    let created = h.orchestrator.create_instance(request("web1")).await.unwrap();
    wait_for_state(&h.orchestrator, created.id, InstanceState::Running).await;

    let stray = h.backend.create(&spec("stray")).await.unwrap();
    let orphans = h.orchestrator.find_orphans().await;
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].backend, "mock");
    assert_eq!(orphans[0].instance.backend_instance_id, stray);
}
