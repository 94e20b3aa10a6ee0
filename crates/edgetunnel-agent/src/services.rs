//! Service registry: logical service names to local TCP endpoints
//!
//! The table is built once at startup and never mutated afterwards. The only
//! runtime input is the link state of the interface that decides which alias
//! a link-dependent service resolves to.

use edgetunnel_proto::ServiceDescriptor;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Separator between a service base name and its alias or index
pub const ALIAS_SEPARATOR: char = '_';

/// Address of the network bridge in front of the controller
pub const BRIDGE_ADDRESS: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 2);

/// Local address of the serial bridge listener
pub const SERIAL_BRIDGE_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Network the indexed sibling systems live on
pub const SIBLING_NETWORK: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 0);

/// Host identifier of the first (master) sibling system
pub const MASTER_SYSTEM_HOST_ID: u32 = 6;

/// Maximum number of sibling systems addressable through the tunnel
pub const MAX_SIBLING_SYSTEMS: u32 = 8;

/// Logical name whose destination depends on the link state
pub const LINK_DEPENDENT_SERVICE: &str = "TIVA";

pub const SSH_TCP_PORT: u16 = 22;
pub const GW_TCP_PORT: u16 = 80;
pub const TIVA_TCP_PORT: u16 = 4001;

/// Default status file of the interface carrying the TCP route
pub const DEFAULT_LINK_STATE_PATH: &str = "/sys/class/net/eth1/operstate";

/// Errors returned by service lookups
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Requested unsupported service: {0}")]
    UnknownService(String),

    #[error("No destination port registered for service: {0}")]
    UnknownPort(String),

    #[error("Invalid destination TCP port {port} for service {service}")]
    InvalidPort { service: String, port: u16 },

    #[error("Invalid destination address for service {service}: {reason}")]
    InvalidAddress { service: String, reason: String },
}

/// Operational state of a network link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Reports the current link state, queried at resolution time
#[cfg_attr(test, mockall::automock)]
pub trait LinkStateProvider: Send + Sync {
    fn link_state(&self) -> LinkState;
}

/// Reads the link state from a sysfs-style operstate file
///
/// Only a first line of exactly `up` reports [`LinkState::Up`]; any other
/// content, an empty file or a read failure reports [`LinkState::Down`].
#[derive(Debug, Clone)]
pub struct FileLinkState {
    path: PathBuf,
}

impl FileLinkState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for FileLinkState {
    fn default() -> Self {
        Self::new(DEFAULT_LINK_STATE_PATH)
    }
}

impl LinkStateProvider for FileLinkState {
    fn link_state(&self) -> LinkState {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.lines().next() == Some("up") => LinkState::Up,
            Ok(_) => LinkState::Down,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to read link state");
                LinkState::Down
            }
        }
    }
}

/// Link state fixed at construction
#[derive(Debug, Clone, Copy)]
pub struct FixedLinkState(pub LinkState);

impl LinkStateProvider for FixedLinkState {
    fn link_state(&self) -> LinkState {
        self.0
    }
}

/// A service whose name gets an alias suffix picked from the link state
#[derive(Debug, Clone)]
struct LinkAlias {
    up: String,
    down: String,
}

/// Immutable mapping from service identifiers to destinations
pub struct ServiceRegistry {
    addresses: HashMap<String, Ipv4Addr>,
    ports: HashMap<String, u16>,
    aliases: HashMap<String, LinkAlias>,
    link_state: Arc<dyn LinkStateProvider>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("addresses", &self.addresses)
            .field("ports", &self.ports)
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn builder(link_state: Arc<dyn LinkStateProvider>) -> ServiceRegistryBuilder {
        ServiceRegistryBuilder {
            addresses: HashMap::new(),
            ports: HashMap::new(),
            aliases: HashMap::new(),
            link_state,
        }
    }

    /// The deployment's service table
    pub fn standard(link_state: Arc<dyn LinkStateProvider>) -> Result<Self, ServiceError> {
        Self::builder(link_state)
            .address("SSH", BRIDGE_ADDRESS)
            .address("GW", BRIDGE_ADDRESS)
            .address("TIVA_TCP", Ipv4Addr::new(169, 254, 0, 6))
            .address("TIVA_RS485", SERIAL_BRIDGE_ADDRESS)
            .indexed_siblings(
                LINK_DEPENDENT_SERVICE,
                SIBLING_NETWORK,
                MASTER_SYSTEM_HOST_ID,
                MAX_SIBLING_SYSTEMS,
            )
            .port("SSH", SSH_TCP_PORT)
            .port("GW", GW_TCP_PORT)
            .port(LINK_DEPENDENT_SERVICE, TIVA_TCP_PORT)
            .link_alias(LINK_DEPENDENT_SERVICE, "TCP", "RS485")
            .build()
    }

    /// Apply the link-dependent alias step to a service name
    pub fn resolve_service_name(&self, service: &str) -> String {
        match self.aliases.get(service) {
            Some(alias) => {
                let suffix = match self.link_state.link_state() {
                    LinkState::Up => &alias.up,
                    LinkState::Down => &alias.down,
                };
                format!("{}{}{}", service, ALIAS_SEPARATOR, suffix)
            }
            None => service.to_string(),
        }
    }

    /// Destination address of a service, after the alias step
    pub fn resolve_address(&self, service: &str) -> Result<Ipv4Addr, ServiceError> {
        let name = self.resolve_service_name(service);
        self.addresses.get(&name).copied().ok_or_else(|| {
            tracing::debug!(service = %service, resolved = %name, "No address registered for service");
            ServiceError::UnknownService(service.to_string())
        })
    }

    /// Destination port of a service base name
    pub fn resolve_port(&self, service_base: &str) -> Result<u16, ServiceError> {
        let port = self.ports.get(service_base).copied().ok_or_else(|| {
            tracing::debug!(service = %service_base, "No port registered for service");
            ServiceError::UnknownPort(service_base.to_string())
        })?;
        validate_port(service_base, port)
    }

    /// Resolve a requested service to its full destination
    pub fn resolve(&self, service: &str) -> Result<ServiceDescriptor, ServiceError> {
        let address = self.resolve_address(service)?;
        let port = self.resolve_port(base_name(service))?;
        Ok(ServiceDescriptor::new(service, address, port))
    }

    /// Number of addressable service names
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Strip an alias or index suffix from a service name
pub fn base_name(service: &str) -> &str {
    match service.rsplit_once(ALIAS_SEPARATOR) {
        Some((base, _)) => base,
        None => service,
    }
}

/// Check that a port is a usable TCP destination port
pub fn validate_port(service: &str, port: u16) -> Result<u16, ServiceError> {
    if port == 0 {
        return Err(ServiceError::InvalidPort {
            service: service.to_string(),
            port,
        });
    }
    Ok(port)
}

/// Builder for [`ServiceRegistry`]
pub struct ServiceRegistryBuilder {
    addresses: HashMap<String, Ipv4Addr>,
    ports: HashMap<String, u16>,
    aliases: HashMap<String, LinkAlias>,
    link_state: Arc<dyn LinkStateProvider>,
}

impl ServiceRegistryBuilder {
    pub fn address(mut self, service: &str, address: Ipv4Addr) -> Self {
        self.addresses.insert(service.to_string(), address);
        self
    }

    pub fn port(mut self, service_base: &str, port: u16) -> Self {
        self.ports.insert(service_base.to_string(), port);
        self
    }

    /// Register `<prefix>_0 .. <prefix>_{count-1}`, sibling `i` at `network + first_host + i`
    pub fn indexed_siblings(
        mut self,
        prefix: &str,
        network: Ipv4Addr,
        first_host: u32,
        count: u32,
    ) -> Self {
        let base = u32::from(network);
        for index in 0..count {
            match first_host
                .checked_add(index)
                .and_then(|host| base.checked_add(host))
            {
                Some(host) => {
                    self.addresses.insert(
                        format!("{}{}{}", prefix, ALIAS_SEPARATOR, index),
                        Ipv4Addr::from(host),
                    );
                }
                None => {
                    tracing::warn!(prefix = %prefix, index = index, "Sibling address overflows, skipping");
                }
            }
        }
        self
    }

    /// Resolve `service` to `service_<up>` or `service_<down>` depending on the link state
    pub fn link_alias(mut self, service: &str, up: &str, down: &str) -> Self {
        self.aliases.insert(
            service.to_string(),
            LinkAlias {
                up: up.to_string(),
                down: down.to_string(),
            },
        );
        self
    }

    pub fn build(self) -> Result<ServiceRegistry, ServiceError> {
        for (service, port) in &self.ports {
            validate_port(service, *port)?;
        }
        for (address_service, address) in &self.addresses {
            if address.is_unspecified() || address.is_broadcast() {
                return Err(ServiceError::InvalidAddress {
                    service: address_service.clone(),
                    reason: format!("{} is not a host address", address),
                });
            }
        }

        tracing::debug!(
            services = self.addresses.len(),
            ports = self.ports.len(),
            "Service registry built"
        );

        Ok(ServiceRegistry {
            addresses: self.addresses,
            ports: self.ports,
            aliases: self.aliases,
            link_state: self.link_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry(state: LinkState) -> ServiceRegistry {
        ServiceRegistry::standard(Arc::new(FixedLinkState(state))).unwrap()
    }

    #[test]
    fn test_resolve_fixed_services() {
        let registry = registry(LinkState::Up);

        let ssh = registry.resolve("SSH").unwrap();
        assert_eq!(ssh.address, BRIDGE_ADDRESS);
        assert_eq!(ssh.port, SSH_TCP_PORT);

        let gw = registry.resolve("GW").unwrap();
        assert_eq!(gw.address, BRIDGE_ADDRESS);
        assert_eq!(gw.port, GW_TCP_PORT);
    }

    #[test]
    fn test_alias_follows_link_state() {
        let up = registry(LinkState::Up);
        assert_eq!(up.resolve_service_name("TIVA"), "TIVA_TCP");
        assert_eq!(
            up.resolve_address("TIVA").unwrap(),
            Ipv4Addr::new(169, 254, 0, 6)
        );

        let down = registry(LinkState::Down);
        assert_eq!(down.resolve_service_name("TIVA"), "TIVA_RS485");
        assert_eq!(down.resolve_address("TIVA").unwrap(), SERIAL_BRIDGE_ADDRESS);

        // Port is looked up on the base name either way
        assert_eq!(up.resolve("TIVA").unwrap().port, TIVA_TCP_PORT);
        assert_eq!(down.resolve("TIVA").unwrap().port, TIVA_TCP_PORT);
    }

    #[test]
    fn test_alias_only_for_link_dependent_service() {
        let registry = registry(LinkState::Up);
        assert_eq!(registry.resolve_service_name("SSH"), "SSH");
        assert_eq!(registry.resolve_service_name("TIVA_3"), "TIVA_3");
    }

    #[test]
    fn test_link_state_queried_per_resolution() {
        let mut provider = MockLinkStateProvider::new();
        let mut states = vec![LinkState::Down, LinkState::Up];
        provider
            .expect_link_state()
            .times(2)
            .returning(move || states.pop().unwrap_or(LinkState::Down));

        let registry = ServiceRegistry::standard(Arc::new(provider)).unwrap();
        assert_eq!(registry.resolve_service_name("TIVA"), "TIVA_TCP");
        assert_eq!(registry.resolve_service_name("TIVA"), "TIVA_RS485");
    }

    #[test]
    fn test_link_state_not_queried_for_plain_services() {
        let mut provider = MockLinkStateProvider::new();
        provider.expect_link_state().never();

        let registry = ServiceRegistry::standard(Arc::new(provider)).unwrap();
        assert!(registry.resolve("SSH").is_ok());
    }

    #[test]
    fn test_indexed_siblings_are_distinct_and_sequential() {
        let registry = registry(LinkState::Up);
        let mut seen = std::collections::HashSet::new();

        for index in 0..MAX_SIBLING_SYSTEMS {
            let name = format!("TIVA_{}", index);
            let address = registry.resolve_address(&name).unwrap();
            assert_eq!(
                u32::from(address),
                u32::from(SIBLING_NETWORK) + MASTER_SYSTEM_HOST_ID + index
            );
            assert!(seen.insert(address), "duplicate address for {}", name);

            assert_eq!(registry.resolve(&name).unwrap().port, TIVA_TCP_PORT);
        }

        assert_eq!(
            registry.resolve_address("TIVA_0").unwrap(),
            Ipv4Addr::new(169, 254, 0, 6)
        );
        let past_end = format!("TIVA_{}", MAX_SIBLING_SYSTEMS);
        assert!(registry.resolve_address(&past_end).is_err());
    }

    #[test]
    fn test_indexed_siblings_overflow_skipped() {
        let registry = ServiceRegistry::builder(Arc::new(FixedLinkState(LinkState::Up)))
            .indexed_siblings("NODE", Ipv4Addr::new(10, 0, 0, 0), u32::MAX, 2)
            .indexed_siblings("EDGE", Ipv4Addr::new(255, 255, 255, 0), 256, 2)
            .indexed_siblings("CORE", Ipv4Addr::new(10, 0, 0, 0), 1, 1)
            .port("NODE", 22)
            .port("EDGE", 22)
            .port("CORE", 22)
            .build()
            .unwrap();

        assert!(registry.resolve_address("NODE_0").is_err());
        assert!(registry.resolve_address("NODE_1").is_err());
        assert!(registry.resolve_address("EDGE_0").is_err());
        assert_eq!(
            registry.resolve_address("CORE_0").unwrap(),
            Ipv4Addr::new(10, 0, 0, 1)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_service_is_not_found() {
        let registry = registry(LinkState::Up);

        assert_eq!(
            registry.resolve_address("TELNET"),
            Err(ServiceError::UnknownService("TELNET".to_string()))
        );
        assert_eq!(
            registry.resolve_port("TELNET"),
            Err(ServiceError::UnknownPort("TELNET".to_string()))
        );
        assert!(registry.resolve("").is_err());
    }

    #[test]
    fn test_address_without_port_is_rejected() {
        let registry = ServiceRegistry::builder(Arc::new(FixedLinkState(LinkState::Up)))
            .address("VNC", Ipv4Addr::new(10, 0, 0, 5))
            .build()
            .unwrap();

        assert!(registry.resolve_address("VNC").is_ok());
        assert!(matches!(
            registry.resolve("VNC"),
            Err(ServiceError::UnknownPort(_))
        ));
    }

    #[test]
    fn test_zero_port_rejected_at_build() {
        let result = ServiceRegistry::builder(Arc::new(FixedLinkState(LinkState::Up)))
            .address("VNC", Ipv4Addr::new(10, 0, 0, 5))
            .port("VNC", 0)
            .build();

        assert!(matches!(result, Err(ServiceError::InvalidPort { .. })));
    }

    #[test]
    fn test_unspecified_address_rejected_at_build() {
        let result = ServiceRegistry::builder(Arc::new(FixedLinkState(LinkState::Up)))
            .address("VNC", Ipv4Addr::UNSPECIFIED)
            .build();

        assert!(matches!(result, Err(ServiceError::InvalidAddress { .. })));
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("TIVA_TCP"), "TIVA");
        assert_eq!(base_name("TIVA_3"), "TIVA");
        assert_eq!(base_name("SSH"), "SSH");
        assert_eq!(base_name(""), "");
    }

    #[test]
    fn test_file_link_state() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "up").unwrap();
        assert_eq!(FileLinkState::new(file.path()).link_state(), LinkState::Up);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "down").unwrap();
        assert_eq!(FileLinkState::new(file.path()).link_state(), LinkState::Down);

        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(FileLinkState::new(file.path()).link_state(), LinkState::Down);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, " up").unwrap();
        assert_eq!(FileLinkState::new(file.path()).link_state(), LinkState::Down);

        assert_eq!(
            FileLinkState::new("/nonexistent/operstate").link_state(),
            LinkState::Down
        );
    }
}
