use anyhow::Context;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use vmgrid_common::bus::{InstanceEventEnvelope, InstanceEventType, CHANNEL_INSTANCE_EVENTS};
use vmgrid_common::InstanceRecord;

pub const EVENT_SOURCE: &str = "vmgrid-orchestrator";

/// In-process fan-out of lifecycle events.
///
/// Publishing never blocks a state change: with no subscribers the event is
/// dropped, and slow subscribers observe `Lagged` instead of stalling writers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<InstanceEventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event_type: InstanceEventType, record: &InstanceRecord) {
        let evt = InstanceEventEnvelope::new(event_type, record, EVENT_SOURCE);
        // Err only means nobody is listening.
        let _ = self.tx.send(evt);
    }
}

pub async fn publish_instance_event(
    conn: &mut redis::aio::MultiplexedConnection,
    evt: &InstanceEventEnvelope,
) -> anyhow::Result<()> {
    let payload = serde_json::to_string(evt)?;
    let _: () = conn.publish(CHANNEL_INSTANCE_EVENTS, payload).await?;
    Ok(())
}

/// Mirrors every bus event onto the Redis `instance_events` channel.
///
/// Best-effort: publish failures are logged and the connection is re-opened
/// for the next event. The task ends when the bus is dropped.
pub fn spawn_redis_forwarder(bus: &EventBus, redis_client: redis::Client) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut conn: Option<redis::aio::MultiplexedConnection> = None;
        loop {
            let evt = match rx.recv().await {
                Ok(evt) => evt,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "redis forwarder lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if conn.is_none() {
                match redis_client
                    .get_multiplexed_async_connection()
                    .await
                    .context("Failed to connect to Redis (publisher)")
                {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        tracing::warn!(error = %e, event = evt.event_type.as_str(), "event not forwarded");
                        continue;
                    }
                }
            }

            if let Some(c) = conn.as_mut() {
                if let Err(e) = publish_instance_event(c, &evt).await {
                    tracing::warn!(
                        error = %e,
                        event = evt.event_type.as_str(),
                        instance_id = %evt.instance_id,
                        "event not forwarded"
                    );
                    conn = None;
                }
            }
        }
        tracing::info!("redis forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use vmgrid_common::CreateInstanceRequest;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let request = CreateInstanceRequest {
            name: "web1".into(),
            ami: "img-1".into(),
            instance_type: "small".into(),
            storage_gb: 10,
            backend: None,
        };
        let record = InstanceRecord::pending(Uuid::new_v4(), &request, "mock", "m-1".into(), Utc::now());

        bus.publish(InstanceEventType::Created, &record);
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.event_type, InstanceEventType::Created);
        assert_eq!(evt.instance_id, record.id);
        assert_eq!(evt.source, EVENT_SOURCE);
        assert_eq!(evt.revision, record.revision);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        let request = CreateInstanceRequest {
            name: "web1".into(),
            ami: "img-1".into(),
            instance_type: "small".into(),
            storage_gb: 10,
            backend: None,
        };
        let record = InstanceRecord::pending(Uuid::new_v4(), &request, "mock", "m-1".into(), Utc::now());
        bus.publish(InstanceEventType::Created, &record);
    }
}
