//! Service configuration.
//!
//! Values come from an optional YAML file, then environment variables
//! (after `.env` is loaded) override individual keys. CLI flags override
//! the listen addresses last.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gateway::ProxyPolicy;
use crate::orchestrator::RetentionPolicy;
use crate::resources::ComputeSpec;

/// Machine capacity handed to the resource ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub max_cpu_cores: f64,
    pub max_ram_gb: f64,
    pub max_disk_gb: f64,
    pub max_network_gbps: f64,
    pub max_sandboxes: u32,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_cpu_cores: 8.0,
            max_ram_gb: 32.0,
            max_disk_gb: 100.0,
            max_network_gbps: 10.0,
            max_sandboxes: 10,
        }
    }
}

impl ResourceSettings {
    pub fn total(&self) -> ComputeSpec {
        ComputeSpec::absolute(
            self.max_cpu_cores,
            self.max_ram_gb,
            self.max_disk_gb,
            self.max_network_gbps,
        )
    }
}

/// Gateway tuning, in config-file units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub max_request_size: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_connections: usize,
    pub chunk_size: usize,
    pub filtered_headers: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let policy = ProxyPolicy::default();
        Self {
            max_request_size: policy.max_request_size,
            connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
            read_timeout_ms: policy.read_timeout.as_millis() as u64,
            total_timeout_ms: policy.total_timeout.as_millis() as u64,
            max_retries: policy.max_retries,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            backoff_factor: policy.backoff_factor,
            max_connections: policy.max_connections,
            chunk_size: policy.chunk_size,
            filtered_headers: policy.filtered_headers,
        }
    }
}

impl GatewaySettings {
    pub fn policy(&self) -> ProxyPolicy {
        ProxyPolicy {
            max_request_size: self.max_request_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            total_timeout: Duration::from_millis(self.total_timeout_ms),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_factor: self.backoff_factor,
            max_connections: self.max_connections,
            chunk_size: self.chunk_size,
            filtered_headers: self
                .filtered_headers
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }
}

/// How much finished sandbox state is kept in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_terminated_sandboxes: usize,
    pub max_history_batches: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        let policy = RetentionPolicy::default();
        Self {
            max_terminated_sandboxes: policy.max_terminal_sandboxes,
            max_history_batches: policy.max_history_batches,
        }
    }
}

impl RetentionSettings {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_terminal_sandboxes: self.max_terminated_sandboxes,
            max_history_batches: self.max_history_batches,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub resources: ResourceSettings,
    pub control_addr: SocketAddr,
    pub gateway_addr: SocketAddr,
    /// Default lifetime of issued API keys. Keys never expire when unset.
    pub api_key_ttl_secs: Option<u64>,
    pub gateway: GatewaySettings,
    pub retention: RetentionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resources: ResourceSettings::default(),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            gateway_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            api_key_ttl_secs: None,
            gateway: GatewaySettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// File (when given) with environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn key_ttl(&self) -> Option<Duration> {
        self.api_key_ttl_secs.map(Duration::from_secs)
    }

    /// Apply every recognised key that `lookup` returns a value for.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = &mut self.resources;
        override_from(&lookup, "SANDBOX_MAX_CPU_CORES", &mut r.max_cpu_cores)?;
        override_from(&lookup, "SANDBOX_MAX_RAM_GB", &mut r.max_ram_gb)?;
        override_from(&lookup, "SANDBOX_MAX_DISK_GB", &mut r.max_disk_gb)?;
        override_from(&lookup, "SANDBOX_MAX_NETWORK_GBPS", &mut r.max_network_gbps)?;
        override_from(&lookup, "SANDBOX_MAX_SANDBOXES", &mut r.max_sandboxes)?;

        override_from(&lookup, "SANDBOXD_CONTROL_ADDR", &mut self.control_addr)?;
        override_from(&lookup, "SANDBOXD_GATEWAY_ADDR", &mut self.gateway_addr)?;
        override_from(
            &lookup,
            "SANDBOXD_MAX_TERMINATED_SANDBOXES",
            &mut self.retention.max_terminated_sandboxes,
        )?;
        override_from(
            &lookup,
            "SANDBOXD_MAX_HISTORY_BATCHES",
            &mut self.retention.max_history_batches,
        )?;
        if let Some(raw) = lookup("SANDBOXD_API_KEY_TTL_SECS") {
            self.api_key_ttl_secs = Some(parse_value("SANDBOXD_API_KEY_TTL_SECS", &raw)?);
        }

        let g = &mut self.gateway;
        override_from(&lookup, "GATEWAY_MAX_REQUEST_SIZE", &mut g.max_request_size)?;
        override_from(&lookup, "GATEWAY_CONNECT_TIMEOUT_MS", &mut g.connect_timeout_ms)?;
        override_from(&lookup, "GATEWAY_READ_TIMEOUT_MS", &mut g.read_timeout_ms)?;
        override_from(&lookup, "GATEWAY_TOTAL_TIMEOUT_MS", &mut g.total_timeout_ms)?;
        override_from(&lookup, "GATEWAY_MAX_RETRIES", &mut g.max_retries)?;
        override_from(&lookup, "GATEWAY_INITIAL_BACKOFF_MS", &mut g.initial_backoff_ms)?;
        override_from(&lookup, "GATEWAY_MAX_BACKOFF_MS", &mut g.max_backoff_ms)?;
        override_from(&lookup, "GATEWAY_BACKOFF_FACTOR", &mut g.backoff_factor)?;
        override_from(&lookup, "GATEWAY_MAX_CONNECTIONS", &mut g.max_connections)?;
        override_from(&lookup, "GATEWAY_CHUNK_SIZE", &mut g.chunk_size)?;
        if let Some(raw) = lookup("GATEWAY_FILTERED_HEADERS") {
            g.filtered_headers = raw
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.resources;
        for (key, value) in [
            ("SANDBOX_MAX_CPU_CORES", r.max_cpu_cores),
            ("SANDBOX_MAX_RAM_GB", r.max_ram_gb),
            ("SANDBOX_MAX_DISK_GB", r.max_disk_gb),
            ("SANDBOX_MAX_NETWORK_GBPS", r.max_network_gbps),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(key, "must be a non-negative number"));
            }
        }

        let g = &self.gateway;
        if g.max_request_size == 0 {
            return Err(invalid("GATEWAY_MAX_REQUEST_SIZE", "must be greater than zero"));
        }
        if g.connect_timeout_ms == 0 {
            return Err(invalid("GATEWAY_CONNECT_TIMEOUT_MS", "must be greater than zero"));
        }
        if g.read_timeout_ms == 0 {
            return Err(invalid("GATEWAY_READ_TIMEOUT_MS", "must be greater than zero"));
        }
        if g.total_timeout_ms == 0 {
            return Err(invalid("GATEWAY_TOTAL_TIMEOUT_MS", "must be greater than zero"));
        }
        if !g.backoff_factor.is_finite() || g.backoff_factor < 1.0 {
            return Err(invalid("GATEWAY_BACKOFF_FACTOR", "must be at least 1.0"));
        }
        if g.max_backoff_ms < g.initial_backoff_ms {
            return Err(invalid(
                "GATEWAY_MAX_BACKOFF_MS",
                "must not be smaller than GATEWAY_INITIAL_BACKOFF_MS",
            ));
        }
        if g.max_connections == 0 {
            return Err(invalid("GATEWAY_MAX_CONNECTIONS", "must be greater than zero"));
        }
        if g.chunk_size == 0 {
            return Err(invalid("GATEWAY_CHUNK_SIZE", "must be greater than zero"));
        }

        if self.retention.max_history_batches == 0 {
            return Err(invalid("SANDBOXD_MAX_HISTORY_BATCHES", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{:?}: {}", raw, e),
    })
}

fn override_from<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = parse_value(key, &raw)?;
    }
    Ok(())
}
