use crate::orchestrator::Orchestrator;

/// Orphan inventory checks run every this many sweeps.
const ORPHAN_SCAN_EVERY: u64 = 10;

/// Housekeeping loop: retention, re-attachment and orphan detection.
pub async fn run(orchestrator: Orchestrator) {
    let mut interval = tokio::time::interval(orchestrator.settings().sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        interval.tick().await;
        ticks += 1;

        let report = orchestrator.sweep().await;
        if report.removed > 0 || report.reattached > 0 {
            tracing::info!(
                removed = report.removed,
                reattached = report.reattached,
                "sweep completed"
            );
        }

        if ticks % ORPHAN_SCAN_EVERY == 0 {
            for orphan in orchestrator.find_orphans().await {
                tracing::warn!(
                    backend = %orphan.backend,
                    backend_instance_id = %orphan.instance.backend_instance_id,
                    name = %orphan.instance.name,
                    status = %orphan.instance.status,
                    "backend instance has no record"
                );
            }
        }
    }
}
