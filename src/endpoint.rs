//! Flow endpoints, transport networks, and port specifications.

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, PortSpecError};

/// Transport-layer network a flow is carried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    /// Parse a network from a string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(Network::Tcp),
            "udp" => Some(Network::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable flow endpoint: address, port, and transport network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
    pub network: Network,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16, network: Network) -> Self {
        Self {
            address,
            port,
            network,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(v4) => write!(f, "{v4}:{}/{}", self.port, self.network),
            IpAddr::V6(v6) => write!(f, "[{v6}]:{}/{}", self.port, self.network),
        }
    }
}

/// The platform's ambient view of a flow's destination, before this
/// crate has resolved it to a concrete [`Endpoint`]. `address` is
/// `None` when the flow's ambient context carries no destination at
/// all, and `Some` of a non-IP string when the destination is a
/// hostname the platform never resolved before handing the flow off.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowTarget {
    pub address: Option<String>,
    pub port: u16,
    pub network: Network,
}

impl FlowTarget {
    pub fn new(address: impl Into<String>, port: u16, network: Network) -> Self {
        Self {
            address: Some(address.into()),
            port,
            network,
        }
    }

    /// A flow whose ambient context carries no destination.
    pub fn none(port: u16, network: Network) -> Self {
        Self {
            address: None,
            port,
            network,
        }
    }

    /// Resolve to a concrete [`Endpoint`], or the error the
    /// destination's absence or shape warrants.
    pub fn resolve(&self) -> Result<Endpoint, Error> {
        let address = self.address.as_deref().ok_or(Error::NoOutbound)?;
        let ip = address
            .parse::<IpAddr>()
            .map_err(|_| Error::UnsupportedFamily(address.to_string()))?;
        Ok(Endpoint::new(ip, self.port, self.network))
    }
}

/// A port specification: a single port, an inclusive dash-delimited
/// range, or "any" (an empty spec matches every port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Any,
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    /// Parse a port-spec string. An empty string or the literal "any"
    /// (case-insensitive) parses as [`PortSpec::Any`].
    pub fn parse(s: &str) -> Result<Self, PortSpecError> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("any") {
            return Ok(PortSpec::Any);
        }

        if let Some((lo, hi)) = s.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .map_err(|_| PortSpecError::InvalidPortSpec(s.to_string()))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .map_err(|_| PortSpecError::InvalidPortSpec(s.to_string()))?;
            if lo > hi {
                return Err(PortSpecError::InvalidPortSpec(s.to_string()));
            }
            return Ok(PortSpec::Range(lo, hi));
        }

        let port: u16 = s
            .parse()
            .map_err(|_| PortSpecError::InvalidPortSpec(s.to_string()))?;
        Ok(PortSpec::Single(port))
    }

    /// Whether `port` lies within this spec.
    pub fn contains(&self, port: u16) -> bool {
        match self {
            PortSpec::Any => true,
            PortSpec::Single(p) => *p == port,
            PortSpec::Range(lo, hi) => port >= *lo && port <= *hi,
        }
    }
}

/// A port mapping: the spec of original ports this mapping applies to,
/// and the single port traffic is translated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMap {
    pub original: PortSpec,
    pub translated: u16,
}

impl PortMap {
    pub fn new(original: PortSpec, translated: u16) -> Self {
        Self {
            original,
            translated,
        }
    }

    /// Resolve the translated port for an observed destination port.
    ///
    /// When `original` is [`PortSpec::Any`], the mapping always applies.
    /// For a single port or range, the mapping applies uniformly to any
    /// port that falls within it; a range never maps to a range.
    pub fn translate(&self, observed: u16) -> u16 {
        if self.original.contains(observed) {
            self.translated
        } else {
            observed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::parse("tcp"), Some(Network::Tcp));
        assert_eq!(Network::parse("UDP"), Some(Network::Udp));
        assert_eq!(Network::parse("sctp"), None);
    }

    #[test]
    fn test_port_spec_any() {
        assert_eq!(PortSpec::parse("").unwrap(), PortSpec::Any);
        assert_eq!(PortSpec::parse("any").unwrap(), PortSpec::Any);
        assert!(PortSpec::Any.contains(1));
        assert!(PortSpec::Any.contains(65535));
    }

    #[test]
    fn test_port_spec_single() {
        let spec = PortSpec::parse("8080").unwrap();
        assert_eq!(spec, PortSpec::Single(8080));
        assert!(spec.contains(8080));
        assert!(!spec.contains(8081));
    }

    #[test]
    fn test_port_spec_range() {
        let spec = PortSpec::parse("8000-8100").unwrap();
        assert_eq!(spec, PortSpec::Range(8000, 8100));
        assert!(spec.contains(8000));
        assert!(spec.contains(8100));
        assert!(spec.contains(8050));
        assert!(!spec.contains(7999));
        assert!(!spec.contains(8101));
    }

    #[test]
    fn test_port_spec_invalid() {
        assert!(PortSpec::parse("abc").is_err());
        assert!(PortSpec::parse("100-50").is_err());
    }

    #[test]
    fn test_port_map_uniform_range() {
        let map = PortMap::new(PortSpec::parse("8000-8100").unwrap(), 80);
        assert_eq!(map.translate(8000), 80);
        assert_eq!(map.translate(8050), 80);
        assert_eq!(map.translate(8100), 80);
        assert_eq!(map.translate(7999), 7999);
    }

    #[test]
    fn test_port_map_any_always_applies() {
        let map = PortMap::new(PortSpec::Any, 443);
        assert_eq!(map.translate(1), 443);
        assert_eq!(map.translate(65535), 443);
    }

    #[test]
    fn test_flow_target_resolves_valid_ip() {
        let target = FlowTarget::new("192.168.1.1", 80, Network::Tcp);
        let ep = target.resolve().unwrap();
        assert_eq!(ep.address.to_string(), "192.168.1.1");
        assert_eq!(ep.port, 80);
    }

    #[test]
    fn test_flow_target_with_no_destination_errors() {
        let target = FlowTarget::none(80, Network::Tcp);
        assert!(matches!(target.resolve(), Err(crate::error::Error::NoOutbound)));
    }

    #[test]
    fn test_flow_target_with_hostname_is_unsupported_family() {
        let target = FlowTarget::new("example.com", 443, Network::Tcp);
        assert!(matches!(
            target.resolve(),
            Err(crate::error::Error::UnsupportedFamily(_))
        ));
    }
}
