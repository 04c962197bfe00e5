//! Discovered service descriptor and the matching rule used to dedupe it.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// One service as seen on one network interface.
///
/// `proto`, `address`, `port` and `extra` are unset on probes built only to
/// look a service up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryService {
    pub name: String,
    pub service_type: String,
    pub intf: String,
    pub proto: Option<String>,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub extra: Option<String>,
}

/// Drop one trailing `.`, then a trailing `local`, then one more trailing `.`.
fn type_prefix(service_type: &str) -> &str {
    let ty = service_type.strip_suffix('.').unwrap_or(service_type);
    let ty = ty.strip_suffix("local").unwrap_or(ty);
    ty.strip_suffix('.').unwrap_or(ty)
}

fn same_text(probe: &Option<String>, other: &Option<String>) -> bool {
    match (probe, other) {
        (None, _) => true,
        (Some(probe), Some(other)) => probe.eq_ignore_ascii_case(other),
        (Some(_), None) => false,
    }
}

fn same_value<T: PartialEq>(probe: &Option<T>, other: &Option<T>) -> bool {
    match probe {
        None => true,
        Some(probe) => other.as_ref() == Some(probe),
    }
}

impl DiscoveryService {
    /// Lookup probe: only name, type and interface set.
    pub fn probe(name: impl Into<String>, service_type: impl Into<String>, intf: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            intf: intf.into(),
            proto: None,
            address: None,
            port: None,
            extra: None,
        }
    }

    pub fn resolved(
        name: impl Into<String>,
        service_type: impl Into<String>,
        intf: impl Into<String>,
        address: IpAddr,
        port: u16,
        extra: Option<String>,
    ) -> Self {
        let proto = if address.is_ipv4() { "IPv4" } else { "IPv6" };
        Self {
            name: name.into(),
            service_type: service_type.into(),
            intf: intf.into(),
            proto: Some(proto.to_string()),
            address: Some(address),
            port: Some(port),
            extra,
        }
    }

    /// True if `other` is the service this one describes.
    ///
    /// Name and interface always compare case-insensitively. The other type
    /// must start with this type stripped of its `.local.` suffix. Unset
    /// proto, address, port and extra match anything.
    pub fn matches(&self, other: &DiscoveryService) -> bool {
        other.name.eq_ignore_ascii_case(&self.name)
            && other.service_type.starts_with(type_prefix(&self.service_type))
            && other.intf.eq_ignore_ascii_case(&self.intf)
            && same_text(&self.proto, &other.proto)
            && same_value(&self.address, &other.address)
            && same_value(&self.port, &other.port)
            && same_text(&self.extra, &other.extra)
    }

    pub fn extract_from<'a>(&self, services: &'a [DiscoveryService]) -> Option<&'a DiscoveryService> {
        services.iter().find(|other| self.matches(other))
    }

    pub fn position_in(&self, services: &[DiscoveryService]) -> Option<usize> {
        services.iter().position(|other| self.matches(other))
    }

    pub fn already_in(&self, services: &[DiscoveryService]) -> bool {
        self.extract_from(services).is_some()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.address?, self.port?))
    }

    pub fn is_loopback(&self) -> bool {
        self.address.map(|a| a.is_loopback()).unwrap_or(false)
    }
}

impl fmt::Display for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}//", self.name, self.intf)?;
        match self.address {
            Some(IpAddr::V6(addr)) => write!(f, "[{}]", addr)?,
            Some(addr) => write!(f, "{}", addr)?,
            None => f.write_str("?")?,
        }
        match self.port {
            Some(port) => write!(f, ":{}", port),
            None => f.write_str(":?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(intf: &str) -> DiscoveryService {
        DiscoveryService::resolved(
            "Office Printer",
            "_lanlink._tcp.local.",
            intf,
            "192.168.1.20".parse().unwrap(),
            1234,
            Some("model=x".into()),
        )
    }

    #[test]
    fn local_suffix_is_tolerated() {
        let found = vec![printer("eth0")];
        assert!(DiscoveryService::probe("office printer", "_lanlink._tcp", "ETH0").already_in(&found));
        assert!(DiscoveryService::probe("office printer", "_lanlink._tcp.local.", "eth0").already_in(&found));
        assert!(DiscoveryService::probe("office printer", "_lanlink._tcp.local", "eth0").already_in(&found));
        assert!(!DiscoveryService::probe("office printer", "_other._tcp", "eth0").already_in(&found));
    }

    #[test]
    fn name_and_interface_are_never_wildcards() {
        let found = vec![printer("eth0")];
        assert!(!DiscoveryService::probe("office printer", "_lanlink._tcp", "wlan0").already_in(&found));
        assert!(!DiscoveryService::probe("kitchen", "_lanlink._tcp", "eth0").already_in(&found));
    }

    #[test]
    fn set_fields_must_agree() {
        let found = vec![printer("eth0"), printer("wlan0")];
        let mut probe = printer("wlan0");
        assert_eq!(probe.position_in(&found), Some(1));

        probe.extra = Some("MODEL=X".into());
        assert!(probe.already_in(&found));

        probe.port = Some(4321);
        assert!(!probe.already_in(&found));

        let mut probe = printer("wlan0");
        probe.proto = Some("IPv6".into());
        assert!(!probe.already_in(&found));

        let mut probe = printer("wlan0");
        probe.address = Some("192.168.1.21".parse().unwrap());
        assert!(!probe.already_in(&found));
    }

    #[test]
    fn probe_extra_requires_candidate_extra() {
        let mut bare = printer("eth0");
        bare.extra = None;
        let probe = printer("eth0");
        assert!(!probe.matches(&bare));
        assert!(bare.matches(&probe));
    }

    #[test]
    fn display_and_address() {
        let service = printer("eth0");
        assert_eq!(service.to_string(), "Office Printer@eth0//192.168.1.20:1234");
        assert_eq!(service.socket_addr(), Some("192.168.1.20:1234".parse().unwrap()));
        assert!(!service.is_loopback());
        assert_eq!(DiscoveryService::probe("a", "_t._tcp", "lo").to_string(), "a@lo//?:?");
    }
}
