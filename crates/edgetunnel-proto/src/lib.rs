//! Edge Tunnel Protocol Definitions
//!
//! Data types shared between the notification channel, the tunneling agent
//! and the relay transports. Nothing in this crate performs I/O.

pub mod notification;
pub mod service;

pub use notification::{ClientMode, TunnelNotification};
pub use service::ServiceDescriptor;

/// Topic format on which the cloud pushes tunnel notifications for a device
pub const NOTIFY_TOPIC_FORMAT: &str = "$aws/things/{thing_name}/tunnels/notify";

/// Build the notification topic for a given thing name
pub fn notify_topic(thing_name: &str) -> String {
    NOTIFY_TOPIC_FORMAT.replace("{thing_name}", thing_name)
}
