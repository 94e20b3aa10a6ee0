//! Resolved local destination for a tunnel

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A logical service resolved to a concrete local endpoint
///
/// Built only after both the address and the port of a service have been
/// validated, and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service identifier as requested (e.g. "SSH")
    pub service_id: String,
    /// Destination IPv4 address
    pub address: Ipv4Addr,
    /// Destination TCP port, never zero
    pub port: u16,
}

impl ServiceDescriptor {
    pub fn new(service_id: impl Into<String>, address: Ipv4Addr, port: u16) -> Self {
        Self {
            service_id: service_id.into(),
            address,
            port,
        }
    }

    /// Socket address of the local endpoint
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}:{}", self.service_id, self.address, self.port)
    }
}
