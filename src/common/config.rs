//! Configuration for eip-manager

use crate::common::utils::parse_duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file, read from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "eip-manager.toml";

/// Environment prefix for overrides (`EIP_MANAGER_CONSUL__ADDRESS=...`).
pub const ENV_PREFIX: &str = "EIP_MANAGER";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level, used when RUST_LOG is unset
    pub log_level: String,

    /// Keep the lock after binding until shutdown or session loss
    pub hold_lock: bool,

    pub consul: ConsulConfig,

    pub metadata: MetadataConfig,

    pub ec2: Ec2Config,

    pub selector: SelectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            hold_lock: false,
            consul: ConsulConfig::default(),
            metadata: MetadataConfig::default(),
            ec2: Ec2Config::default(),
            selector: SelectorConfig::default(),
        }
    }
}

/// Consul agent connection and lock session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Agent HTTP address
    pub address: String,

    /// ACL token sent as X-Consul-Token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Session TTL; the session is renewed every TTL/2
    #[serde(with = "duration_str")]
    pub session_ttl: Duration,

    /// Lock delay applied by Consul after the session is invalidated
    #[serde(with = "duration_str")]
    pub lock_delay: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            session_ttl: Duration::from_secs(15),
            lock_delay: Duration::from_secs(15),
        }
    }
}

/// Instance metadata service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub endpoint: String,

    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://169.254.169.254".to_string(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// EC2 API settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ec2Config {
    /// Override for the regional endpoint (LocalStack, VPC endpoints)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Ec2Config {
    /// Endpoint to use for `region`
    pub fn endpoint_for(&self, region: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://ec2.{}.amazonaws.com", region),
        }
    }
}

/// Slot selection retry intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Wait when the directory has no slots yet
    #[serde(with = "duration_str")]
    pub empty_backoff: Duration,

    /// Wait after every slot in a round was contended
    #[serde(with = "duration_str")]
    pub contended_backoff: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            empty_backoff: Duration::from_secs(3),
            contended_backoff: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Load config from `EIP_MANAGER_CONFIG` or `eip-manager.toml`, then the environment.
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var(format!("{}_CONFIG", ENV_PREFIX))
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut config = Self::load_from(&path)?;
        config.apply_consul_env(
            std::env::var("CONSUL_HTTP_ADDR").ok(),
            std::env::var("CONSUL_HTTP_TOKEN").ok(),
        );
        Ok(config)
    }

    /// Load from a specific file (optional) layered under `EIP_MANAGER_*` variables.
    pub fn load_from(path: impl AsRef<Path>) -> crate::Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the standard Consul client variables
    pub fn apply_consul_env(&mut self, addr: Option<String>, token: Option<String>) {
        if let Some(addr) = addr.filter(|a| !a.is_empty()) {
            self.consul.address = if addr.contains("://") {
                addr
            } else {
                format!("http://{}", addr)
            };
        }
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.consul.token = Some(token);
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.consul.session_ttl < Duration::from_secs(10)
            || self.consul.session_ttl > Duration::from_secs(86400)
        {
            return Err(crate::Error::InvalidConfig(format!(
                "consul.session_ttl must be between 10s and 24h, got {:?}",
                self.consul.session_ttl
            )));
        }
        if self.consul.lock_delay > Duration::from_secs(60) {
            return Err(crate::Error::InvalidConfig(
                "consul.lock_delay must be at most 60s".into(),
            ));
        }
        if self.consul.address.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "consul.address cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
