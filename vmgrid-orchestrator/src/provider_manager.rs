use std::sync::Arc;

use vmgrid_providers::BackendAdapter;

use crate::config::Settings;

pub struct ProviderManager;

impl ProviderManager {
    /// Builds every adapter enabled at compile time and configured at runtime.
    ///
    /// `mock` is only registered when listed in `VMGRID_BACKENDS`; `scaleway`
    /// needs a project id and a secret key.
    pub fn build_adapters(settings: &Settings) -> anyhow::Result<Vec<Arc<dyn BackendAdapter>>> {
        let mut adapters: Vec<Arc<dyn BackendAdapter>> = Vec::new();
        adapters.extend(mock_adapter(settings));
        adapters.extend(scaleway_adapter(settings)?);

        let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        tracing::info!(backends = ?names, "backends registered");
        Ok(adapters)
    }
}

#[cfg(feature = "provider-mock")]
fn mock_adapter(settings: &Settings) -> Option<Arc<dyn BackendAdapter>> {
    use vmgrid_providers::mock::MockBackend;

    if !settings.backends.iter().any(|b| b == "mock") {
        return None;
    }
    Some(Arc::new(
        MockBackend::new("mock").with_boot_polls(settings.mock_boot_polls),
    ))
}

#[cfg(not(feature = "provider-mock"))]
fn mock_adapter(_settings: &Settings) -> Option<Arc<dyn BackendAdapter>> {
    None
}

#[cfg(feature = "provider-scaleway")]
fn scaleway_adapter(settings: &Settings) -> anyhow::Result<Option<Arc<dyn BackendAdapter>>> {
    use vmgrid_providers::scaleway::ScalewayBackend;

    let Some(scw) = &settings.scaleway else {
        return Ok(None);
    };
    // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
    let secret_key = std::fs::read_to_string(&scw.secret_key_file)
        .ok()
        .or_else(|| scw.secret_key.clone())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let Some(secret_key) = secret_key else {
        tracing::warn!("SCALEWAY_PROJECT_ID set without a secret key, scaleway disabled");
        return Ok(None);
    };
    let backend = ScalewayBackend::new(scw.project_id.clone(), secret_key, scw.zone.clone())?;
    Ok(Some(Arc::new(backend)))
}

#[cfg(not(feature = "provider-scaleway"))]
fn scaleway_adapter(_settings: &Settings) -> anyhow::Result<Option<Arc<dyn BackendAdapter>>> {
    Ok(None)
}
