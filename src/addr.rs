//! CIDR parsing, address classification, and RFC 6052 IPv4-in-IPv6
//! embedding/extraction.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::AddrError;

/// Classification of an address with respect to embedded-IPv4 support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrClass {
    V4,
    V6,
    V6WithEmbeddedV4,
}

/// Stateless helpers for CIDR containment and RFC 6052 address handling.
pub struct AddrCodec;

impl AddrCodec {
    /// Parse a CIDR string into an [`IpNet`].
    pub fn parse_cidr(s: &str) -> Result<IpNet, AddrError> {
        s.trim()
            .parse::<IpNet>()
            .map_err(|_| AddrError::InvalidCidr(s.to_string()))
    }

    /// Whether `ip` is contained in `network`. Mixed address families
    /// never match.
    pub fn contains_ip(network: &IpNet, ip: &IpAddr) -> bool {
        network.contains(ip)
    }

    /// Classify an address literal for embedded-IPv4 handling.
    pub fn classify(addr: &str) -> Option<AddrClass> {
        if addr.trim().parse::<Ipv4Addr>().is_ok() {
            return Some(AddrClass::V4);
        }
        if addr.trim().parse::<Ipv6Addr>().is_ok() {
            return Some(if Self::extract_embedded_v4(addr).is_some() {
                AddrClass::V6WithEmbeddedV4
            } else {
                AddrClass::V6
            });
        }
        None
    }

    /// Extract an IPv4 address embedded in an IPv6 address literal per
    /// RFC 6052 §2.4, recognizing two textual forms:
    ///
    /// 1. Mixed notation: any colon-delimited hextet that literally
    ///    contains a dot is the embedded IPv4, e.g.
    ///    `64:FF9B:1111::192.168.1.100`.
    /// 2. Compressed hex notation: the last two hextets trailing a
    ///    `::` are decoded as the high/low bytes of two 16-bit groups,
    ///    e.g. `c0a8:164` -> `192.168.1.100`.
    ///
    /// Addresses that fit neither form return `None`. This is
    /// deliberately heuristic: any address whose compressed form ends
    /// in exactly two hextets after `::` is treated as carrying an
    /// embedded IPv4, whether or not that was the author's intent.
    pub fn extract_embedded_v4(addr: &str) -> Option<Ipv4Addr> {
        let addr = addr.trim();

        // Form 1: textual mixed notation, a hextet containing a dot.
        for group in addr.split(':') {
            if group.contains('.') {
                return group.parse::<Ipv4Addr>().ok();
            }
        }

        // Form 2: compressed hex notation, exactly two hextets after `::`.
        let (_, tail) = addr.split_once("::")?;
        if tail.is_empty() {
            return None;
        }
        let groups: Vec<&str> = tail.split(':').collect();
        if groups.len() != 2 {
            return None;
        }
        let hi = parse_hextet(groups[0])?;
        let lo = parse_hextet(groups[1])?;
        Some(Ipv4Addr::new(
            (hi >> 8) as u8,
            (hi & 0xff) as u8,
            (lo >> 8) as u8,
            (lo & 0xff) as u8,
        ))
    }

    /// Embed `v4` into `prefix` (a /96 IPv6 network) per RFC 6052,
    /// placing the IPv4 address in the low 32 bits. The constructive
    /// counterpart to [`Self::extract_embedded_v4`], used for the
    /// round-trip property test.
    pub fn embed_v4(v4: Ipv4Addr, prefix: &IpNet) -> Result<Ipv6Addr, AddrError> {
        let IpNet::V6(v6prefix) = prefix else {
            return Err(AddrError::InvalidCidr(prefix.to_string()));
        };
        if v6prefix.prefix_len() != 96 {
            return Err(AddrError::InvalidCidr(prefix.to_string()));
        }
        let mut octets = v6prefix.network().octets();
        octets[12..16].copy_from_slice(&v4.octets());
        Ok(Ipv6Addr::from(octets))
    }
}

/// Parse a hextet (1-4 hex digits) into its `u16` value.
fn parse_hextet(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 4 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(s, 16).ok()
}
