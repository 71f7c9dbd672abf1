// Startup wiring: record store, backends, recovery and the Redis event forwarder
use std::sync::Arc;

use vmgrid_orchestrator::events::spawn_redis_forwarder;
use vmgrid_orchestrator::{MemoryStore, Orchestrator, PgRecordStore, ProviderManager, RecordStore, Settings};

use crate::config::{database, redis};

/// Builds the orchestrator and resumes every in-flight record.
///
/// Postgres and Redis are optional: without `DATABASE_URL` records only live
/// in memory, without `REDIS_URL` events stay in-process.
pub async fn build_orchestrator(settings: Settings) -> anyhow::Result<Orchestrator> {
    let store: Arc<dyn RecordStore> = match settings.database_url.as_deref() {
        Some(url) => {
            let pool = database::create_pool(url).await?;
            tracing::info!("record mirror: postgres");
            Arc::new(PgRecordStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let redis_client = match settings.redis_url.as_deref() {
        Some(url) => Some(redis::create_client(url).await?),
        None => None,
    };

    let adapters = ProviderManager::build_adapters(&settings)?;
    let orchestrator = Orchestrator::new(settings, adapters, store)?;

    if let Some(client) = redis_client {
        spawn_redis_forwarder(orchestrator.events(), client);
        tracing::info!("lifecycle events forwarded to redis");
    }

    orchestrator.recover().await?;
    Ok(orchestrator)
}
