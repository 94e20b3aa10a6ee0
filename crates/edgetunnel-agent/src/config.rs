//! Tunneling feature configuration
//!
//! Loaded from YAML, then overridden field by field from the command line.

use crate::services::DEFAULT_LINK_STATE_PATH;
use edgetunnel_proto::ServiceDescriptor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hostname prefix of the regional tunneling data plane
pub const ENDPOINT_PREFIX: &str = "data.tunneling.iot";
/// Domain of the regional tunneling data plane
pub const ENDPOINT_DOMAIN: &str = "amazonaws.com";
/// Regions carrying this prefix live under a country-specific domain
pub const CHINA_REGION_PREFIX: &str = "cn-";

/// Service id given to the destination of a static-mode tunnel
pub const STATIC_SERVICE_ID: &str = "STATIC";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Thing name is required when subscribing to tunnel notifications")]
    MissingThingName,

    #[error("Static tunnel requires {0}")]
    MissingField(&'static str),

    #[error("Invalid destination address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid destination port {0} (expected 1-65535)")]
    InvalidPort(u32),
}

/// Configuration of the tunneling feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TunnelingConfig {
    /// Identity used for the notification subscription
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thing_name: Option<String>,

    /// Wait for cloud notifications instead of opening one static tunnel
    pub subscribe_notification: bool,

    /// Explicit relay endpoint, derived from the region when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_access_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// Extra PEM trust anchors for the relay TLS connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<PathBuf>,

    pub link_state_path: PathBuf,

    /// Request process shutdown whenever a tunnel closes
    pub exit_on_tunnel_close: bool,

    /// How long stop() waits for sessions to report closure
    pub stop_grace_secs: u64,
}

impl Default for TunnelingConfig {
    fn default() -> Self {
        Self {
            thing_name: None,
            subscribe_notification: true,
            endpoint: None,
            destination_access_token: None,
            region: None,
            address: None,
            port: None,
            root_ca: None,
            link_state_path: PathBuf::from(DEFAULT_LINK_STATE_PATH),
            exit_on_tunnel_close: false,
            stop_grace_secs: 5,
        }
    }
}

/// Parameters of the single static-mode tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTunnel {
    pub access_token: String,
    pub region: String,
    pub endpoint: String,
    pub destination: ServiceDescriptor,
}

impl TunnelingConfig {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    /// Check the fields the selected mode needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscribe_notification {
            match self.thing_name.as_deref() {
                Some(name) if !name.trim().is_empty() => Ok(()),
                _ => Err(ConfigError::MissingThingName),
            }
        } else {
            self.static_tunnel().map(|_| ())
        }
    }

    /// Relay endpoint for a region, honouring the configured override
    pub fn endpoint(&self, region: &str) -> String {
        match self.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => endpoint_for(region),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Extract the static-mode tunnel parameters
    pub fn static_tunnel(&self) -> Result<StaticTunnel, ConfigError> {
        let access_token = non_empty(&self.destination_access_token)
            .ok_or(ConfigError::MissingField("destination_access_token"))?;
        let region = non_empty(&self.region).ok_or(ConfigError::MissingField("region"))?;
        let address = non_empty(&self.address).ok_or(ConfigError::MissingField("address"))?;
        let port = self.port.ok_or(ConfigError::MissingField("port"))?;

        let ip: Ipv4Addr = address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let port = u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or(ConfigError::InvalidPort(port))?;

        Ok(StaticTunnel {
            access_token: access_token.to_string(),
            region: region.to_string(),
            endpoint: self.endpoint(region),
            destination: ServiceDescriptor::new(STATIC_SERVICE_ID, ip, port),
        })
    }
}

/// Derive the regional relay endpoint
pub fn endpoint_for(region: &str) -> String {
    let mut endpoint = format!("{}.{}.{}", ENDPOINT_PREFIX, region, ENDPOINT_DOMAIN);
    if region.starts_with(CHINA_REGION_PREFIX) {
        endpoint.push_str(".cn");
    }
    endpoint
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
