//! WebSocket relay transport
//!
//! Connects to the secure tunneling service in destination mode:
//!
//! - **Encryption**: TLS via rustls (wss://), web PKI roots plus an optional root CA file
//! - **Authentication**: destination access token sent in the `access-token` header
//! - **Data**: tunneled bytes travel in binary WebSocket frames
//!
//! # Example
//!
//! ```no_run
//! use edgetunnel_transport::RelayConnector;
//! use edgetunnel_transport_websocket::{WebSocketRelayConfig, WebSocketRelayConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = WebSocketRelayConnector::new(WebSocketRelayConfig::default())?;
//! let connection = connector
//!     .connect("destination-token", "data.tunneling.iot.us-east-1.amazonaws.com")
//!     .await?;
//! connection.send_bytes(b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;

pub use config::WebSocketRelayConfig;
pub use connection::{WebSocketRelayConnection, WebSocketRelayConnector};
