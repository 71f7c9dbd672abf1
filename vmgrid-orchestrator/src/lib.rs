//! Instance provisioning orchestrator.
//!
//! Creates virtual machines through pluggable backends, tracks each one in an
//! in-memory registry and reconciles it in the background until it is
//! reachable or gone.

pub mod backoff;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod logger;
pub mod migrations;
pub mod orchestrator;
pub mod provider_manager;
pub mod reconciler;
pub mod registry;
pub mod selector;
pub mod state_machine;
pub mod store;
pub mod sweeper;

pub use config::Settings;
pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, Orphan, RecoveryReport, SweepReport};
pub use provider_manager::ProviderManager;
pub use selector::BackendHealth;
pub use store::{MemoryStore, PgRecordStore, RecordStore};
pub use vmgrid_providers::{BackendAdapter, BackendError};
