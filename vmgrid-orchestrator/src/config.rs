use anyhow::{bail, Context as _};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Backends the crate knows how to build, checked for per-backend overrides
/// even when they are not listed in `VMGRID_BACKENDS`.
const KNOWN_BACKENDS: &[&str] = &["mock", "scaleway"];

/// Upper bound for every `*_SECS` setting (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 3600;

/// Poll cadence and wait budgets for the lifecycle reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_boot_wait: Duration,
    pub max_terminate_wait: Duration,
    /// Still-present polls after terminate before the call is re-issued once.
    pub reissue_terminate_after: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_boot_wait: Duration::from_secs(600),
            max_terminate_wait: Duration::from_secs(600),
            reissue_terminate_after: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendOverrides {
    pub ssh_user: Option<String>,
    pub require_public_ip: bool,
}

impl Default for BackendOverrides {
    fn default() -> Self {
        Self {
            ssh_user: None,
            require_public_ip: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalewaySettings {
    pub project_id: String,
    pub secret_key: Option<String>,
    pub secret_key_file: String,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Preference order. Empty means round-robin over every registered backend.
    pub backends: Vec<String>,
    pub poll: PollPolicy,
    /// Limit for each adapter call (create, describe, terminate, list).
    pub call_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub unhealthy_cooldown: Duration,
    /// How long terminal records are kept. `None` keeps them forever.
    pub retention: Option<Duration>,
    pub sweep_interval: Duration,
    pub event_capacity: usize,
    pub overrides: HashMap<String, BackendOverrides>,
    pub scaleway: Option<ScalewaySettings>,
    pub mock_boot_polls: u32,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backends: vec!["mock".to_string()],
            poll: PollPolicy::default(),
            call_timeout: Duration::from_secs(60),
            unhealthy_threshold: 3,
            unhealthy_cooldown: Duration::from_secs(60),
            retention: None,
            sweep_interval: Duration::from_secs(30),
            event_capacity: 1024,
            overrides: HashMap::new(),
            scaleway: None,
            mock_boot_polls: 2,
            database_url: None,
            redis_url: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let backends: Vec<String> = match get("VMGRID_BACKENDS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.backends.clone(),
        };

        let poll = PollPolicy {
            initial: secs(&get, "VMGRID_POLL_INITIAL_SECS", defaults.poll.initial)?,
            max: secs(&get, "VMGRID_POLL_MAX_SECS", defaults.poll.max)?,
            multiplier: parse(&get, "VMGRID_POLL_MULTIPLIER", defaults.poll.multiplier)?,
            max_boot_wait: secs(&get, "VMGRID_MAX_BOOT_WAIT_SECS", defaults.poll.max_boot_wait)?,
            max_terminate_wait: secs(
                &get,
                "VMGRID_MAX_TERMINATE_WAIT_SECS",
                defaults.poll.max_terminate_wait,
            )?,
            reissue_terminate_after: parse(
                &get,
                "VMGRID_REISSUE_TERMINATE_AFTER",
                defaults.poll.reissue_terminate_after,
            )?,
        };
        if poll.initial.is_zero() {
            bail!("VMGRID_POLL_INITIAL_SECS must be at least 1");
        }
        if poll.max < poll.initial {
            bail!("VMGRID_POLL_MAX_SECS must not be lower than VMGRID_POLL_INITIAL_SECS");
        }
        if !(poll.multiplier >= 1.0 && poll.multiplier.is_finite()) {
            bail!("VMGRID_POLL_MULTIPLIER must be a finite number >= 1.0");
        }

        let retention = match get("VMGRID_RETENTION_SECS") {
            Some(_) => Some(secs(&get, "VMGRID_RETENTION_SECS", Duration::ZERO)?),
            None => None,
        };

        let mut names: Vec<String> = KNOWN_BACKENDS.iter().map(|s| s.to_string()).collect();
        for name in &backends {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        let mut overrides = HashMap::new();
        for name in names {
            let prefix = name.to_ascii_uppercase().replace('-', "_");
            let ssh_user = get(&format!("{prefix}_SSH_USER"));
            let require_public_ip = parse_bool(&get, &format!("{prefix}_REQUIRE_PUBLIC_IP"), true)?;
            if ssh_user.is_some() || !require_public_ip {
                overrides.insert(
                    name,
                    BackendOverrides {
                        ssh_user,
                        require_public_ip,
                    },
                );
            }
        }

        let scaleway = get("SCALEWAY_PROJECT_ID").map(|project_id| ScalewaySettings {
            project_id,
            secret_key: get("SCALEWAY_SECRET_KEY"),
            secret_key_file: get("SCALEWAY_SECRET_KEY_FILE")
                .unwrap_or_else(|| "/run/secrets/scaleway_secret_key".to_string()),
            zone: get("SCALEWAY_ZONE").unwrap_or_else(|| "fr-par-2".to_string()),
        });

        let unhealthy_threshold: u32 =
            parse(&get, "VMGRID_UNHEALTHY_THRESHOLD", defaults.unhealthy_threshold)?;
        if unhealthy_threshold == 0 {
            bail!("VMGRID_UNHEALTHY_THRESHOLD must be at least 1");
        }

        Ok(Self {
            backends,
            poll,
            call_timeout: secs(&get, "VMGRID_CALL_TIMEOUT_SECS", defaults.call_timeout)?,
            unhealthy_threshold,
            unhealthy_cooldown: secs(
                &get,
                "VMGRID_UNHEALTHY_COOLDOWN_SECS",
                defaults.unhealthy_cooldown,
            )?,
            retention,
            sweep_interval: secs(&get, "VMGRID_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            event_capacity: parse(&get, "VMGRID_EVENT_CAPACITY", defaults.event_capacity)?.max(1),
            overrides,
            scaleway,
            mock_boot_polls: parse(&get, "MOCK_BOOT_POLLS", defaults.mock_boot_polls)?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
        })
    }

    pub fn overrides_for(&self, backend: &str) -> BackendOverrides {
        self.overrides.get(backend).cloned().unwrap_or_default()
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: Duration) -> anyhow::Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default.as_secs())?;
    if value > MAX_DURATION_SECS {
        bail!("{key} must not exceed {MAX_DURATION_SECS} seconds, got {value}");
    }
    Ok(Duration::from_secs(value))
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> anyhow::Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("invalid value for {key}: {v}"),
    }
}
