// Events stream handler (SSE)
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::IntoParams;

use crate::app::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct EventsStreamParams {
    /// Only forward events of this instance.
    pub instance_id: Option<uuid::Uuid>,
}

/// Lifecycle events as server-sent events, one `EVT:*` envelope per message.
#[utoipa::path(
    get,
    path = "/events",
    params(EventsStreamParams),
    responses(
        (status = 200, description = "text/event-stream of lifecycle events")
    )
)]
pub async fn events_stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsStreamParams>,
) -> Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>> {
    let mut bus = state.orchestrator.subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);

    tokio::spawn(async move {
        // Quick handshake
        let hello = Event::default().event("hello").data(r#"{"ok":true}"#);
        if tx.send(Ok(hello)).await.is_err() {
            return;
        }

        loop {
            let evt = match bus.recv().await {
                Ok(evt) => evt,
                Err(RecvError::Lagged(skipped)) => {
                    let lagged = Event::default()
                        .event("lagged")
                        .data(format!(r#"{{"skipped":{skipped}}}"#));
                    if tx.send(Ok(lagged)).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if params.instance_id.is_some_and(|id| id != evt.instance_id) {
                continue;
            }

            let data = match serde_json::to_string(&evt) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(error = %e, "event not serializable");
                    continue;
                }
            };
            let event = Event::default()
                .event(evt.event_type.as_str())
                .id(evt.event_id.to_string())
                .data(data);
            // Client went away
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
