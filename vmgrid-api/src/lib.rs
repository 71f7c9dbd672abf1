// Library entry point for tests and external usage
// Re-exports all modules needed for testing

pub mod api_docs;
pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod setup;

// Re-export commonly used types
pub use app::AppState;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Full HTTP application: routes, CORS and request tracing, state applied.
pub fn build_app(state: Arc<AppState>) -> Router {
    routes::create_router()
        .layer(app::create_cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
