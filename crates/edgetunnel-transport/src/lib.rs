//! Transport abstraction layer for the tunneling agent
//!
//! The agent never speaks the secure-tunnel wire protocol or the cloud
//! notification protocol itself. It drives them through the traits defined
//! here, so the session lifecycle can be exercised against any transport.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 edgetunnel-agent                         │
//! │        (service registry, sessions, orchestrator)        │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            edgetunnel-transport (this crate)             │
//! │  - RelayConnector       - RelayConnection                │
//! │  - NotificationSource                                    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────┬──────────────────┬───────────────┐
//! │ edgetunnel-transport-│ notify sources   │ memory relay  │
//! │ websocket            │ (channel, jsonl) │ (test-util)   │
//! └──────────────────────┴──────────────────┴───────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use edgetunnel_proto::TunnelNotification;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod notify;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use notify::{ChannelNotificationSource, JsonLinesNotificationSource};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An established relay connection carrying the bytes of one tunnel
///
/// Both directions take `&self` so a connection can be shared between the
/// session that owns it and the byte pump that drives it.
#[async_trait]
pub trait RelayConnection: Send + Sync + Debug {
    /// Send tunneled bytes towards the remote peer
    async fn send_bytes(&self, data: &[u8]) -> TransportResult<()>;

    /// Receive the next chunk of tunneled bytes
    ///
    /// Returns `None` once the relay connection has been closed, by either side.
    async fn recv_bytes(&self) -> TransportResult<Option<Bytes>>;

    /// Close the connection gracefully
    async fn close(&self, reason: &str);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Stable identifier for logging and correlation
    fn connection_id(&self) -> String;
}

/// Client-side: performs the relay-connect handshake
///
/// The connector is shared by every session and owned by the process, the
/// agent only borrows it to open connections.
#[async_trait]
pub trait RelayConnector: Send + Sync + Debug {
    /// Connect to the tunneling service in destination mode
    ///
    /// # Arguments
    /// * `access_token` - Destination access token for this tunnel
    /// * `endpoint` - Relay endpoint host (e.g., "data.tunneling.iot.us-east-1.amazonaws.com")
    async fn connect(
        &self,
        access_token: &str,
        endpoint: &str,
    ) -> TransportResult<Arc<dyn RelayConnection>>;
}

/// Delivers tunnel notifications pushed by the cloud
#[async_trait]
pub trait NotificationSource: Send + Sync + Debug {
    /// Subscribe to tunnel notifications for the given thing
    ///
    /// Notifications arrive on the returned channel in delivery order. The
    /// channel closes when the source has nothing more to deliver.
    async fn subscribe(
        &self,
        thing_name: &str,
    ) -> TransportResult<mpsc::Receiver<TunnelNotification>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::SubscriptionFailed("broker refused".to_string());
        assert_eq!(err.to_string(), "Subscription failed: broker refused");

        let err = TransportError::StreamClosed;
        assert_eq!(err.to_string(), "Stream closed");
    }
}
