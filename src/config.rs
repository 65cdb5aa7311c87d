//! Declarative TOML configuration, ported from `internal/config/parser.go`
//! and `internal/config/config.go`, and validated per spec §4.E.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no upstreams configured")]
    NoUpstreams,
    #[error("upstream '{0}' has a static provider but no servers")]
    NoServers(String),
    #[error("upstream '{0}' has a server with an empty path")]
    EmptyServerPath(String),
    #[error("no locations configured")]
    NoLocations,
    #[error("location '{path}' references unknown upstream '{upstream}'")]
    UnknownUpstream { path: String, upstream: String },
    #[error("location '{0}' has an invalid regular expression: {1}")]
    InvalidPattern(String, regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    RoundRobin,
    Random,
}

impl Default for BalancerKind {
    fn default() -> Self {
        BalancerKind::RoundRobin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Static,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::Static
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamConfig>,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub balancer: BalancerKind,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub path: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default = "default_max_fail")]
    pub max_fail: usize,
    #[serde(default = "default_fail_timeout_secs")]
    pub fail_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub path: String,
    pub http_pass: String,
    /// Headers overlaid on every request forwarded through this location
    /// (§4.C: "operator-configured headers overlay afterward").
    #[serde(default)]
    pub pass_headers: HashMap<String, String>,
}

fn default_max_fail() -> usize {
    10
}

fn default_fail_timeout_secs() -> u64 {
    1
}

fn default_port() -> u16 {
    8080
}

/// A validated, ready-to-compose configuration. Construction is the only
/// way to obtain one, so downstream code never has to re-check the
/// invariants enforced in `validate`.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstreams: HashMap<String, UpstreamConfig>,
    pub server: ServerConfig,
}

impl Config {
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents)?;
        validate(&raw)?;
        Ok(Config {
            upstreams: raw.upstreams,
            server: raw.server,
        })
    }
}

fn validate(raw: &RawConfig) -> Result<(), ConfigError> {
    if raw.upstreams.is_empty() {
        return Err(ConfigError::NoUpstreams);
    }

    for (name, upstream) in &raw.upstreams {
        if upstream.provider == ProviderKind::Static {
            if upstream.servers.is_empty() {
                return Err(ConfigError::NoServers(name.clone()));
            }
            for server in &upstream.servers {
                if server.path.trim().is_empty() {
                    return Err(ConfigError::EmptyServerPath(name.clone()));
                }
            }
        }
    }

    if raw.server.locations.is_empty() {
        return Err(ConfigError::NoLocations);
    }

    for loc in &raw.server.locations {
        regex::Regex::new(&loc.path).map_err(|e| ConfigError::InvalidPattern(loc.path.clone(), e))?;
        if !raw.upstreams.contains_key(&loc.http_pass) {
            return Err(ConfigError::UnknownUpstream {
                path: loc.path.clone(),
                upstream: loc.http_pass.clone(),
            });
        }
    }

    Ok(())
}
