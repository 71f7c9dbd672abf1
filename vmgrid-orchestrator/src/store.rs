use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use uuid::Uuid;
use vmgrid_common::{InstanceRecord, InstanceState};

/// Durable mirror of the registry, read back on startup.
///
/// Writes are keyed by id and ordered by `revision`: an upsert carrying an
/// older revision than the stored one is ignored, so out-of-order mirror
/// writes never roll a record back.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: &InstanceRecord) -> anyhow::Result<()>;

    /// Every stored record, in creation order.
    async fn load_all(&self) -> anyhow::Result<Vec<InstanceRecord>>;

    async fn remove(&self, id: Uuid) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, InstanceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<InstanceRecord> {
        self.records.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        match records.get(&record.id) {
            Some(stored) if stored.revision >= record.revision => {}
            _ => {
                records.insert(record.id, record.clone());
            }
        }
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<InstanceRecord>> {
        let mut all: Vec<_> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn remove(&self, id: Uuid) -> anyhow::Result<()> {
        self.records.lock().remove(&id);
        Ok(())
    }
}

/// Postgres-backed store using the `vmgrid_instances` table.
/// Uses query()/bind() so no DATABASE_URL is needed at build time.
#[derive(Clone)]
pub struct PgRecordStore {
    db: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    name: String,
    ami: String,
    instance_type: String,
    storage_gb: i64,
    backend_used: String,
    backend_instance_id: String,
    state: InstanceState,
    public_ip: Option<String>,
    ssh_string: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    terminated_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl From<InstanceRow> for InstanceRecord {
    fn from(row: InstanceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            public_ip: row.public_ip,
            ssh_string: row.ssh_string,
            state: row.state,
            ami: row.ami,
            instance_type: row.instance_type,
            storage_gb: row.storage_gb,
            backend_used: row.backend_used,
            backend_instance_id: row.backend_instance_id,
            error_code: row.error_code,
            error_message: row.error_message,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
            terminated_at: row.terminated_at,
            failed_at: row.failed_at,
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO vmgrid_instances
             (id, name, ami, instance_type, storage_gb, backend_used, backend_instance_id, state,
              public_ip, ssh_string, error_code, error_message, revision,
              created_at, updated_at, terminated_at, failed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                public_ip = EXCLUDED.public_ip,
                ssh_string = EXCLUDED.ssh_string,
                error_code = EXCLUDED.error_code,
                error_message = EXCLUDED.error_message,
                revision = EXCLUDED.revision,
                updated_at = EXCLUDED.updated_at,
                terminated_at = EXCLUDED.terminated_at,
                failed_at = EXCLUDED.failed_at
             WHERE vmgrid_instances.revision < EXCLUDED.revision",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.ami)
        .bind(&record.instance_type)
        .bind(record.storage_gb)
        .bind(&record.backend_used)
        .bind(&record.backend_instance_id)
        .bind(record.state)
        .bind(&record.public_ip)
        .bind(&record.ssh_string)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(record.revision)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.terminated_at)
        .bind(record.failed_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<InstanceRecord>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            "SELECT id, name, ami, instance_type, storage_gb, backend_used, backend_instance_id,
                    state, public_ip, ssh_string, error_code, error_message, revision,
                    created_at, updated_at, terminated_at, failed_at
             FROM vmgrid_instances
             ORDER BY created_at, id",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(InstanceRecord::from).collect())
    }

    async fn remove(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM vmgrid_instances WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmgrid_common::CreateInstanceRequest;

    fn record() -> InstanceRecord {
        let request = CreateInstanceRequest {
            name: "web1".into(),
            ami: "img-1".into(),
            instance_type: "small".into(),
            storage_gb: 10,
            backend: None,
        };
        InstanceRecord::pending(Uuid::new_v4(), &request, "mock", "m-1".into(), Utc::now())
    }

    #[tokio::test]
    async fn stale_revisions_do_not_overwrite() {
        let store = MemoryStore::new();
        let mut rec = record();
        store.upsert(&rec).await.unwrap();

        let stale = rec.clone();
        rec.state = InstanceState::Running;
        rec.revision += 1;
        store.upsert(&rec).await.unwrap();
        store.upsert(&stale).await.unwrap();

        assert_eq!(store.get(rec.id).unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn load_all_returns_creation_order() {
        let store = MemoryStore::new();
        let first = record();
        let mut second = record();
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        store.upsert(&second).await.unwrap();
        store.upsert(&first).await.unwrap();

        let ids: Vec<_> = store.load_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        store.remove(first.id).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
