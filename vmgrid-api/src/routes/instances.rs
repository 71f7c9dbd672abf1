// Instance lifecycle, backend health and event stream routes
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::app::AppState;
use crate::handlers::{backends, events, instances};

pub fn create_instance_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/instances",
            get(instances::list_instances).post(instances::create_instance),
        )
        .route(
            "/instances/{id}",
            get(instances::get_instance).delete(instances::terminate_instance),
        )
        .route("/backends", get(backends::list_backends))
        .route("/events", get(events::events_stream))
}
