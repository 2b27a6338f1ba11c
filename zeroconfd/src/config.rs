use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_MAX_COLLISION_RETRIES;
use shared::types::DedupMode;
use crate::mdns::publisher::RegistrationRequest;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zeroconfd/zeroconfd.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Overrides RUST_LOG when set
    pub log_filter: Option<String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressResolution {
    /// Interface-scoped multicast address query
    #[default]
    Multicast,
    /// System resolver
    HostLookup,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    /// Browsed from startup
    #[serde(default)]
    pub service_types: Vec<String>,
    #[serde(default)]
    pub address_resolution: AddressResolution,
    #[serde(default)]
    pub dedup: DedupMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_max_collision_retries")]
    pub max_collision_retries: u32,
    /// Published from startup
    #[serde(default)]
    pub services: Vec<RegistrationRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MdnsConfig {
    /// Restrict the daemon to one interface; all interfaces when unset
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_max_collision_retries() -> u32 {
    DEFAULT_MAX_COLLISION_RETRIES
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_collision_retries: default_max_collision_retries(),
            services: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}
