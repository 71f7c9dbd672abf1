use anyhow::bail;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use vmgrid_common::ValidationErrors;
use vmgrid_providers::{BackendAdapter, BackendError};

use crate::error::OrchestratorError;

/// Classification of one adapter call for health bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    TransientFailure,
    /// A definitive answer from the backend (rejection, unconfirmed create).
    Failure,
}

impl CallOutcome {
    pub fn of<T>(result: &Result<T, BackendError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(e) if e.is_retryable() => CallOutcome::TransientFailure,
            Err(_) => CallOutcome::Failure,
        }
    }
}

#[derive(Debug, Default)]
struct HealthWindow {
    consecutive_transient: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Position in the preference list, if listed.
    pub preference_rank: Option<usize>,
}

/// Picks the backend for new instances.
///
/// An explicit hint wins and bypasses health. Otherwise the first healthy
/// backend of the preference list is used, or round-robin over every
/// registered backend when the list is empty. A backend is unhealthy after
/// `threshold` consecutive transient failures and becomes eligible again for
/// a probe once `cooldown` has passed since its last failure.
pub struct BackendSelector {
    adapters: Vec<Arc<dyn BackendAdapter>>,
    preference: Vec<String>,
    threshold: u32,
    cooldown: Duration,
    health: Mutex<HashMap<String, HealthWindow>>,
    cursor: AtomicUsize,
}

impl BackendSelector {
    pub fn new(
        adapters: Vec<Arc<dyn BackendAdapter>>,
        preference: Vec<String>,
        threshold: u32,
        cooldown: Duration,
    ) -> anyhow::Result<Self> {
        for (i, adapter) in adapters.iter().enumerate() {
            if adapters[..i].iter().any(|a| a.name() == adapter.name()) {
                bail!("backend {} registered twice", adapter.name());
            }
        }
        for name in &preference {
            if !adapters.iter().any(|a| a.name() == name) {
                bail!("backend {} is listed in VMGRID_BACKENDS but not available", name);
            }
        }
        Ok(Self {
            adapters,
            preference,
            threshold: threshold.max(1),
            cooldown,
            health: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    pub fn adapters(&self) -> &[Arc<dyn BackendAdapter>] {
        &self.adapters
    }

    pub fn select(&self, hint: Option<&str>) -> Result<Arc<dyn BackendAdapter>, OrchestratorError> {
        if let Some(hint) = hint {
            let hint = hint.trim().to_ascii_lowercase();
            return self.adapter(&hint).ok_or_else(|| {
                OrchestratorError::Validation(ValidationErrors::single(
                    "backend",
                    "is not a registered backend",
                ))
            });
        }

        if self.adapters.is_empty() {
            return Err(OrchestratorError::NoAvailableBackend(
                "no backend is registered".to_string(),
            ));
        }

        if !self.preference.is_empty() {
            return self
                .preference
                .iter()
                .find(|name| self.is_healthy(name))
                .and_then(|name| self.adapter(name))
                .ok_or_else(|| {
                    OrchestratorError::NoAvailableBackend(format!(
                        "every preferred backend is unhealthy: {}",
                        self.preference.join(", ")
                    ))
                });
        }

        let n = self.adapters.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .map(|i| &self.adapters[(start + i) % n])
            .find(|a| self.is_healthy(a.name()))
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::NoAvailableBackend("every backend is unhealthy".to_string())
            })
    }

    pub fn record_outcome(&self, name: &str, outcome: CallOutcome) {
        let mut health = self.health.lock();
        let window = health.entry(name.to_string()).or_default();
        match outcome {
            CallOutcome::TransientFailure => {
                window.consecutive_transient += 1;
                window.last_failure = Some(Instant::now());
                if window.consecutive_transient == self.threshold {
                    tracing::warn!(
                        backend = name,
                        failures = window.consecutive_transient,
                        "backend marked unhealthy"
                    );
                }
            }
            CallOutcome::Success | CallOutcome::Failure => {
                if window.consecutive_transient >= self.threshold {
                    tracing::info!(backend = name, "backend healthy again");
                }
                window.consecutive_transient = 0;
            }
        }
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        let health = self.health.lock();
        match health.get(name) {
            None => true,
            Some(w) if w.consecutive_transient < self.threshold => true,
            Some(w) => w
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.cooldown),
        }
    }

    pub fn health_snapshot(&self) -> Vec<BackendHealth> {
        self.adapters
            .iter()
            .map(|a| {
                let name = a.name().to_string();
                let consecutive_failures = self
                    .health
                    .lock()
                    .get(&name)
                    .map_or(0, |w| w.consecutive_transient);
                BackendHealth {
                    healthy: self.is_healthy(&name),
                    consecutive_failures,
                    preference_rank: self.preference.iter().position(|p| *p == name),
                    name,
                }
            })
            .collect()
    }
}
