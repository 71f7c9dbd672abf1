// Runtime configuration for the HTTP service
pub mod database;
pub mod redis;

use anyhow::Context as _;
use std::net::SocketAddr;
use vmgrid_orchestrator::Settings;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8003";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
    pub settings: Settings,
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var("VMGRID_LISTEN_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for VMGRID_LISTEN_ADDR: {raw}"))?;
        Ok(Self {
            listen_addr,
            settings: Settings::from_env()?,
        })
    }
}
