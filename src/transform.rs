//! Destination translation: rewriting a flow's virtual destination into
//! its real destination and port.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::addr::AddrCodec;
use crate::config::NatRule;
use crate::endpoint::{Endpoint, PortMap, PortSpec};
use crate::error::{Error, Result};

/// Stateless destination-rewriting logic, applied once a [`NatRule`] has
/// been resolved for a flow.
pub struct Transformer;

impl Transformer {
    /// Rewrite `dest` into its real-network endpoint under `rule`.
    ///
    /// Three cases, checked in order:
    /// 1. `dest`'s address is IPv6 with an embedded IPv4 (either
    ///    textual form `AddrCodec::extract_embedded_v4` recognizes):
    ///    the real address is the embedded IPv4 itself, and
    ///    `realDestination` is ignored.
    /// 2. The rule's virtual destination is a CIDR: the host bits of
    ///    `dest` within that network are preserved when projected onto
    ///    `realDestination`'s network, so a /24-to-/24 range rule acts
    ///    as a uniform 1:1 remap rather than collapsing every
    ///    destination onto one address.
    /// 3. Otherwise the virtual destination is a literal address and
    ///    `realDestination` is used as a literal address directly.
    pub fn dnat(dest: &Endpoint, rule: &NatRule) -> Result<Endpoint> {
        let address = if let Some(v4) = embedded_v4(dest.address) {
            IpAddr::V4(v4)
        } else if rule.virtual_destination.contains('/') {
            let virtual_net = AddrCodec::parse_cidr(&rule.virtual_destination)
                .map_err(|_| Error::AddressInvalid(rule.virtual_destination.clone()))?;
            match AddrCodec::parse_cidr(&rule.real_destination) {
                Ok(real_net) => project_host_bits(dest.address, &virtual_net, &real_net)
                    .unwrap_or(real_net.network()),
                Err(_) => rule
                    .real_destination
                    .parse::<IpAddr>()
                    .map_err(|_| Error::AddressInvalid(rule.real_destination.clone()))?,
            }
        } else {
            rule.real_destination
                .parse::<IpAddr>()
                .map_err(|_| Error::AddressInvalid(rule.real_destination.clone()))?
        };

        let port = match &rule.port_mapping {
            Some(mapping) => {
                let spec = PortSpec::parse(&mapping.original_port).unwrap_or(PortSpec::Any);
                PortMap::new(spec, mapping.translated_port).translate(dest.port)
            }
            None => dest.port,
        };

        Ok(Endpoint::new(address, port, dest.network))
    }
}

/// An IPv6 address's embedded IPv4, if it has one. IPv4 addresses never
/// carry an embedding.
fn embedded_v4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(_) => None,
        IpAddr::V6(_) => AddrCodec::extract_embedded_v4(&addr.to_string()),
    }
}

/// Preserve the host-bit portion of `ip` within `from_net` when
/// projected onto `to_net`. Returns `None` if the two networks are not
/// the same address family.
fn project_host_bits(ip: IpAddr, from_net: &IpNet, to_net: &IpNet) -> Option<IpAddr> {
    match (ip, from_net, to_net) {
        (IpAddr::V4(v4), IpNet::V4(from), IpNet::V4(to)) => {
            let mask = host_mask_v4(from.prefix_len());
            let host_bits = u32::from(v4) & mask;
            let base = u32::from(to.network());
            Some(IpAddr::V4(Ipv4Addr::from(base | host_bits)))
        }
        (IpAddr::V6(v6), IpNet::V6(from), IpNet::V6(to)) => {
            let mask = host_mask_v6(from.prefix_len());
            let host_bits = u128::from(v6) & mask;
            let base = u128::from(to.network());
            Some(IpAddr::V6(Ipv6Addr::from(base | host_bits)))
        }
        _ => None,
    }
}

fn host_mask_v4(prefix_len: u8) -> u32 {
    if prefix_len >= 32 {
        0
    } else {
        u32::MAX >> prefix_len
    }
}

fn host_mask_v6(prefix_len: u8) -> u128 {
    if prefix_len >= 128 {
        0
    } else {
        u128::MAX >> prefix_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortMapping;
    use crate::endpoint::Network;

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port, Network::Tcp)
    }

    fn rule(virtual_dest: &str, real_dest: &str, port_mapping: Option<PortMapping>) -> NatRule {
        NatRule {
            rule_id: "r1".to_string(),
            source_site: String::new(),
            virtual_destination: virtual_dest.to_string(),
            real_destination: real_dest.to_string(),
            protocol: String::new(),
            port_mapping,
        }
    }

    #[test]
    fn test_literal_dnat() {
        let r = rule("240.2.2.20", "192.168.1.20", None);
        let out = Transformer::dnat(&ep("240.2.2.20", 80), &r).unwrap();
        assert_eq!(out.address.to_string(), "192.168.1.20");
        assert_eq!(out.port, 80);
    }

    #[test]
    fn test_cidr_range_preserves_host_bits() {
        let r = rule("240.2.2.0/24", "192.168.1.0/24", None);
        let out = Transformer::dnat(&ep("240.2.2.77", 443), &r).unwrap();
        assert_eq!(out.address.to_string(), "192.168.1.77");
    }

    #[test]
    fn test_embedded_v4_override_ignores_real_destination() {
        let r = rule("64:ff9b:1111::c0a8:164", "10.0.0.0/24", None);
        let out = Transformer::dnat(&ep("64:ff9b:1111::c0a8:164", 80), &r).unwrap();
        assert_eq!(out.address.to_string(), "192.168.1.100");
    }

    #[test]
    fn test_port_mapping_translates() {
        let mapping = PortMapping {
            original_port: "8000-9000".to_string(),
            translated_port: 80,
        };
        let r = rule("240.2.2.20", "192.168.1.20", Some(mapping));
        let out = Transformer::dnat(&ep("240.2.2.20", 8080), &r).unwrap();
        assert_eq!(out.port, 80);
    }

    #[test]
    fn test_port_outside_mapping_spec_passes_through() {
        let mapping = PortMapping {
            original_port: "8000-9000".to_string(),
            translated_port: 80,
        };
        let r = rule("240.2.2.20", "192.168.1.20", Some(mapping));
        let out = Transformer::dnat(&ep("240.2.2.20", 22), &r).unwrap();
        assert_eq!(out.port, 22);
    }

    #[test]
    fn test_invalid_real_destination_errors() {
        let r = rule("240.2.2.20", "not-an-address", None);
        assert!(Transformer::dnat(&ep("240.2.2.20", 80), &r).is_err());
    }
}
