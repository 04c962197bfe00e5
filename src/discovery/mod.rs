//! LAN service discovery.
//!
//! [`Publisher`] advertises a service and confirms it by discovering itself,
//! [`Discover`] tracks the services of one type. Both run on a pluggable
//! [`DiscoveryBackend`] picked by name with [`backend`].

mod discover;
pub mod mdns;
pub mod memory;
pub mod names;
mod publisher;
mod service;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::DiscoveryError;

pub use discover::Discover;
pub use publisher::Publisher;
pub use service::DiscoveryService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Stopped,
    Startup,
    Started,
    Shutdown,
}

impl DiscoveryState {
    pub fn is_running(&self) -> bool {
        matches!(self, DiscoveryState::Startup | DiscoveryState::Started)
    }
}

pub trait DiscoveryStateListener: Send + Sync {
    fn on_start(&self, _service_type: &str) {}
    fn on_stop(&self, _service_type: &str) {}
    fn on_fail(&self, _service_type: &str, _error: &str) {}
}

pub trait DiscoveryServicesListener: Send + Sync {
    fn on_service_discovered(&self, _service: &DiscoveryService) {}
    fn on_service_lost(&self, _service: &DiscoveryService) {}
}

/// What a backend reports to a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Resolved(DiscoveryService),
    Removed(DiscoveryService),
}

/// Handle of one browse session on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrowseId(pub(crate) u64);

/// A service to advertise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub service_type: String,
    pub name: String,
    pub port: u16,
    pub extra: Option<String>,
}

/// Discovery system implementation.
///
/// Browsing delivers events on the given channel until `stop_browse`.
/// A backend must accept several browse sessions for the same type.
pub trait DiscoveryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn browse(&self, service_type: &str, events: UnboundedSender<BackendEvent>) -> Result<BrowseId, DiscoveryError>;

    fn stop_browse(&self, id: BrowseId) -> Result<(), DiscoveryError>;

    /// Advertise `registration` and return the key `unregister` takes.
    fn register(&self, registration: &Registration) -> Result<String, DiscoveryError>;

    fn unregister(&self, key: &str) -> Result<(), DiscoveryError>;
}

/// Implementation names accepted by [`backend`].
pub const IMPLEMENTATIONS: [&str; 3] = ["auto", "mdns", "memory"];

/// Pick a backend by (case-insensitive) name. `auto` selects mDNS.
pub fn backend(implementation: &str) -> Result<Arc<dyn DiscoveryBackend>, DiscoveryError> {
    match implementation.to_ascii_lowercase().as_str() {
        "auto" | "mdns" => Ok(mdns::MdnsBackend::shared()?),
        "memory" => Ok(Arc::new(memory::MemoryBackend::shared())),
        _ => Err(DiscoveryError::UnknownImplementation(implementation.to_string())),
    }
}

/// Interface owning `address` among the local ones.
///
/// Exact matches win, then the first interface on the same subnet guess
/// (/24 for IPv4, /64 for IPv6), then the first non-loopback interface of
/// the same family.
pub(crate) fn interface_for(address: IpAddr, interfaces: &[(String, IpAddr)]) -> Option<String> {
    if let Some((name, _)) = interfaces.iter().find(|(_, ip)| *ip == address) {
        return Some(name.clone());
    }
    let same_net = |ip: &IpAddr| match (ip, address) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
        _ => false,
    };
    if let Some((name, _)) = interfaces.iter().find(|(_, ip)| same_net(ip)) {
        return Some(name.clone());
    }
    interfaces
        .iter()
        .find(|(_, ip)| !ip.is_loopback() && ip.is_ipv4() == address.is_ipv4())
        .map(|(name, _)| name.clone())
}
