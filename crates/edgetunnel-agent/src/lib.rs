//! Secure tunnel orchestration for the edge agent
//!
//! This crate decides *which* tunnels exist and *where* they lead:
//! - [`ServiceRegistry`] maps requested service names to local endpoints
//! - [`notification`] validates cloud tunnel notifications
//! - [`TunnelSession`] owns one relay connection and its local TCP bridge
//! - [`SessionRegistry`] tracks the active sessions
//! - [`TunnelingFeature`] ties it together, in subscription or static mode
//!
//! Transports are injected through the traits of `edgetunnel-transport`.

pub mod config;
pub mod feature;
pub mod forwarder;
pub mod notification;
pub mod registry;
pub mod services;
pub mod session;

pub use config::{endpoint_for, ConfigError, StaticTunnel, TunnelingConfig};
pub use feature::{AgentError, FeatureEvent, TunnelingFeature};
pub use forwarder::{ForwardEnd, ForwardStats, ForwarderError, TcpForwarder};
pub use notification::{NotificationError, TunnelRequest};
pub use registry::SessionRegistry;
pub use services::{
    FileLinkState, FixedLinkState, LinkState, LinkStateProvider, ServiceError, ServiceRegistry,
};
pub use session::{
    CloseReason, SessionError, SessionEvent, SessionId, SessionInfo, SessionState, TunnelSession,
};
