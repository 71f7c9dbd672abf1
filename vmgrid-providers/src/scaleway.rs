use crate::{
    inventory, BackendAdapter, BackendError, BackendStatus, CreateSpec, InstanceObservation,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;

const API_BASE: &str = "https://api.scaleway.com/instance/v1";
const TAG: &str = "vmgrid";

pub struct ScalewayBackend {
    client: Client,
    project_id: String,
    secret_key: String,
    zone: String,
    base_url: String,
}

impl ScalewayBackend {
    pub fn new(project_id: String, secret_key: String, zone: String) -> Result<Self, BackendError> {
        // Default reqwest client has no overall timeout. If Scaleway stalls, a poll can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| BackendError::Rejected(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            project_id: project_id.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            zone: zone.trim().to_string(),
            base_url: API_BASE.to_string(),
        })
    }

    /// Points the adapter at another API root (staging, test doubles).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn servers_url(&self) -> String {
        format!("{}/zones/{}/servers", self.base_url, self.zone)
    }

    fn server_url(&self, server_id: &str) -> String {
        format!("{}/{}", self.servers_url(), server_id)
    }

    async fn error_from_response(&self, what: &str, resp: reqwest::Response) -> BackendError {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(backend = "scaleway", %status, body = %text, "{} failed", what);
        classify_status(status, format!("{} failed: status={} body={}", what, status, text))
    }
}

/// 5xx and 429 are worth retrying, any other non-success is final.
fn classify_status(status: StatusCode, message: String) -> BackendError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::Transient(message)
    } else {
        BackendError::Rejected(message)
    }
}

fn transport_error(what: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Transient(format!("{} timed out: {}", what, err))
    } else {
        BackendError::Transient(format!("{}: {}", what, err))
    }
}

/// Maps a Scaleway server state to the uniform status.
fn map_server_state(state: &str) -> BackendStatus {
    match state.to_ascii_lowercase().as_str() {
        "running" => BackendStatus::Running,
        "starting" | "stopped" | "stopped in place" | "stopped_in_place" | "stopping" => {
            BackendStatus::Booting
        }
        "locked" => BackendStatus::Failed,
        _ => BackendStatus::Booting,
    }
}

/// Root volume size in bytes; refuses sizes that do not fit the API's integer.
fn root_volume_bytes(storage_gb: i64) -> Result<i64, BackendError> {
    storage_gb
        .checked_mul(1_000_000_000)
        .ok_or_else(|| BackendError::Rejected(format!("storage_gb too large: {}", storage_gb)))
}

fn observation_from_server(server: &serde_json::Value) -> InstanceObservation {
    let status = server["state"]
        .as_str()
        .map(map_server_state)
        .unwrap_or(BackendStatus::Booting);
    // public_ip.address is null while a flexible IP is still being attached
    let public_ip = server["public_ip"]["address"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    InstanceObservation::new(status, public_ip)
}

#[async_trait]
impl BackendAdapter for ScalewayBackend {
    fn name(&self) -> &str {
        "scaleway"
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, BackendError> {
        let url = self.servers_url();
        let volume_bytes = root_volume_bytes(spec.storage_gb)?;
        let body = json!({
            "name": spec.name,
            "commercial_type": spec.instance_type,
            "image": spec.ami,
            "project": self.project_id,
            "tags": [TAG],
            "dynamic_ip_required": true,
            "volumes": {
                "0": { "size": volume_bytes, "volume_type": "sbs_volume" }
            }
        });

        tracing::info!(
            backend = "scaleway",
            zone = %self.zone,
            instance_type = %spec.instance_type,
            image = %spec.ami,
            "POST {}",
            url
        );

        let resp = match self
            .client
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            // Connect failures never reach the API; anything later may have created a server.
            Err(e) if e.is_connect() => return Err(transport_error("create", e)),
            Err(e) => {
                return Err(BackendError::Unconfirmed(format!(
                    "create request interrupted: {}",
                    e
                )))
            }
        };

        if !resp.status().is_success() {
            return Err(self.error_from_response("create", resp).await);
        }

        let json_resp: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Unconfirmed(format!("unreadable create response: {}", e)))?;
        let server_id = json_resp["server"]["id"]
            .as_str()
            .ok_or_else(|| BackendError::Unconfirmed("no server id in create response".into()))?
            .to_string();

        // Scaleway creates servers stopped; power on right away.
        let action_url = format!("{}/action", self.server_url(&server_id));
        let resp = self
            .client
            .post(&action_url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&json!({ "action": "poweron" }))
            .send()
            .await
            .map_err(|e| {
                BackendError::Unconfirmed(format!("server {} created, poweron failed: {}", server_id, e))
            })?;
        if !resp.status().is_success() {
            let err = self.error_from_response("poweron", resp).await;
            return Err(BackendError::Unconfirmed(format!(
                "server {} created but not started: {}",
                server_id, err
            )));
        }

        tracing::info!(backend = "scaleway", backend_instance_id = %server_id, "server created");
        Ok(server_id)
    }

    async fn describe(&self, backend_instance_id: &str) -> Result<InstanceObservation, BackendError> {
        let url = self.server_url(backend_instance_id);
        let resp = self
            .client
            .get(&url)
            .header("X-Auth-Token", &self.secret_key)
            .send()
            .await
            .map_err(|e| transport_error("describe", e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(InstanceObservation::not_found());
        }
        if !resp.status().is_success() {
            return Err(self.error_from_response("describe", resp).await);
        }

        let json_resp: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("unreadable describe response: {}", e)))?;
        Ok(observation_from_server(&json_resp["server"]))
    }

    async fn terminate(&self, backend_instance_id: &str) -> Result<(), BackendError> {
        // The terminate action powers off, then deletes the server and its volumes.
        let url = format!("{}/action", self.server_url(backend_instance_id));
        let resp = self
            .client
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&json!({ "action": "terminate" }))
            .send()
            .await
            .map_err(|e| transport_error("terminate", e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            tracing::info!(backend = "scaleway", backend_instance_id, "server already gone");
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // A terminate already in progress is answered with a conflict.
            if status == StatusCode::CONFLICT || text.contains("already in progress") {
                return Ok(());
            }
            return Err(classify_status(
                status,
                format!("terminate failed: status={} body={}", status, text),
            ));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<inventory::DiscoveredInstance>, BackendError> {
        let resp = self
            .client
            .get(self.servers_url())
            .header("X-Auth-Token", &self.secret_key)
            .query(&[("tags", TAG), ("project", self.project_id.as_str())])
            .send()
            .await
            .map_err(|e| transport_error("list", e))?;
        if !resp.status().is_success() {
            return Err(self.error_from_response("list", resp).await);
        }

        let json_resp: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("unreadable list response: {}", e)))?;
        let servers = json_resp["servers"].as_array().cloned().unwrap_or_default();
        Ok(servers
            .iter()
            .filter_map(|server| {
                let id = server["id"].as_str()?;
                Some(inventory::DiscoveredInstance {
                    backend_instance_id: id.to_string(),
                    name: server["name"].as_str().unwrap_or_default().to_string(),
                    status: server["state"].as_str().unwrap_or("unknown").to_string(),
                    ip_address: observation_from_server(server).public_ip,
                    created_at: server["creation_date"].as_str().map(|s| s.to_string()),
                })
            })
            .collect())
    }

    fn default_ssh_user(&self) -> Option<&str> {
        Some("root")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_states_map_to_uniform_status() {
        assert_eq!(map_server_state("running"), BackendStatus::Running);
        assert_eq!(map_server_state("starting"), BackendStatus::Booting);
        assert_eq!(map_server_state("locked"), BackendStatus::Failed);
    }

    #[test]
    fn observation_reads_dynamic_ip() {
        let server = json!({"state": "running", "public_ip": {"address": "51.15.0.7"}});
        let obs = observation_from_server(&server);
        assert_eq!(obs.status, BackendStatus::Running);
        assert_eq!(obs.public_ip.as_deref(), Some("51.15.0.7"));

        let pending_ip = json!({"state": "running", "public_ip": {"id": "ip-1", "address": null}});
        assert_eq!(observation_from_server(&pending_ip).public_ip, None);
    }

    #[test]
    fn http_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "x".into()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x".into()).is_retryable());
        assert!(!classify_status(StatusCode::FORBIDDEN, "quota".into()).is_retryable());
    }

    #[test]
    fn volume_size_overflow_is_rejected() {
        assert_eq!(root_volume_bytes(20).ok(), Some(20_000_000_000));
        let err = root_volume_bytes(10_000_000_000).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "BACKEND_REJECTED");
    }

    #[test]
    fn create_with_huge_volume_fails_before_any_request() {
        let backend = ScalewayBackend::new("p".into(), "k".into(), "fr-par-2".into())
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        let spec = CreateSpec {
            name: "big".into(),
            ami: "ubuntu".into(),
            instance_type: "DEV1-S".into(),
            storage_gb: 10_000_000_000,
        };
        let err = tokio_test::block_on(backend.create(&spec)).unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }
}
