//! Tunnel notification payload pushed by the cloud

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Role requested for this device in the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// The device initiates connections into the tunnel
    Source,
    /// The device forwards tunneled traffic to a local TCP endpoint
    Destination,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown client mode: {0}")]
pub struct UnknownClientMode(pub String);

impl FromStr for ClientMode {
    type Err = UnknownClientMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(ClientMode::Source),
            "destination" => Ok(ClientMode::Destination),
            other => Err(UnknownClientMode(other.to_string())),
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMode::Source => write!(f, "source"),
            ClientMode::Destination => write!(f, "destination"),
        }
    }
}

/// A tunnel notification as delivered on the notify topic
///
/// Every field is optional on the wire. The agent validates the content
/// before acting on it, so deserialization never rejects a payload for
/// missing fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelNotification {
    /// Raw client mode string (`source` or `destination`)
    #[serde(default, alias = "ClientMode")]
    pub client_mode: String,

    /// Requested services, in the order given by the peer
    #[serde(default, alias = "Services", skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,

    /// Per-connection access token for the destination side
    #[serde(
        default,
        alias = "ClientAccessToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_access_token: Option<String>,

    /// Region hosting the tunnel
    #[serde(default, alias = "Region", skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl TunnelNotification {
    /// Parse the client mode, if it is one of the known values
    pub fn mode(&self) -> Result<ClientMode, UnknownClientMode> {
        self.client_mode.parse()
    }

    /// Requested services, empty when the field is absent
    pub fn services(&self) -> &[String] {
        self.services.as_deref().unwrap_or_default()
    }

    /// Access token, treating an empty string as absent
    pub fn access_token(&self) -> Option<&str> {
        self.client_access_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }

    /// Region, treating an empty string as absent
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref().filter(|region| !region.is_empty())
    }

    /// Parse a notification from its JSON document
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
