//! Configuration surface consumed from the platform's config loader.
//!
//! This module only defines the shape and validates it; parsing the
//! surrounding platform config file and wiring it up to this handler is
//! the platform's concern.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default TCP session timeout, seconds.
pub const DEFAULT_TCP_TIMEOUT_SEC: u32 = 300;
/// Default UDP session timeout, seconds.
pub const DEFAULT_UDP_TIMEOUT_SEC: u32 = 60;
/// Default sweep interval, seconds.
pub const DEFAULT_SWEEP_SEC: u32 = 30;
/// Default maximum concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;
/// Default memory budget for the session table, megabytes.
pub const DEFAULT_MAX_MEMORY_MB: usize = 100;
/// Default LRU eviction threshold.
pub const DEFAULT_EVICT_THRESHOLD: f64 = 0.8;

/// Per-session-entry memory estimate used to derive the effective
/// session cap from `maxMemoryMB`.
pub const SESSION_MEMORY_ESTIMATE_BYTES: usize = 2 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualRangeWire {
    virtual_network: String,
    real_network: String,
    #[serde(default)]
    ipv6_enabled: bool,
    #[serde(default)]
    ipv6_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortMappingWire {
    #[serde(default)]
    original_port: String,
    translated_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NatRuleWire {
    rule_id: String,
    #[serde(default)]
    source_site: String,
    virtual_destination: String,
    #[serde(default)]
    real_destination: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    port_mapping: Option<PortMappingWire>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionTimeoutWire {
    #[serde(default)]
    tcp_timeout: Option<u32>,
    #[serde(default)]
    udp_timeout: Option<u32>,
    #[serde(default)]
    cleanup_interval: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLimitsWire {
    #[serde(default)]
    max_sessions: Option<usize>,
    #[serde(default)]
    max_memory_mb: Option<usize>,
    #[serde(default)]
    cleanup_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigWire {
    site_id: String,
    #[serde(default)]
    virtual_ranges: Vec<VirtualRangeWire>,
    #[serde(default)]
    rules: Vec<NatRuleWire>,
    #[serde(default)]
    session_timeout: Option<SessionTimeoutWire>,
    #[serde(default)]
    resource_limits: Option<ResourceLimitsWire>,
}

/// A virtual-to-real address range advertised by a site.
#[derive(Debug, Clone)]
pub struct VirtualRange {
    pub virtual_network: String,
    pub real_network: String,
    pub ipv6_enabled: bool,
    pub ipv6_prefix: String,
}

/// An original/translated port pair.
#[derive(Debug, Clone)]
pub struct PortMapping {
    pub original_port: String,
    pub translated_port: u16,
}

/// A single NAT rule, evaluated in config order.
#[derive(Debug, Clone)]
pub struct NatRule {
    pub rule_id: String,
    pub source_site: String,
    pub virtual_destination: String,
    pub real_destination: String,
    pub protocol: String,
    pub port_mapping: Option<PortMapping>,
}

/// Session timeout and sweep configuration, seconds.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeout {
    pub tcp_sec: u32,
    pub udp_sec: u32,
    pub sweep_sec: u32,
}

impl Default for SessionTimeout {
    fn default() -> Self {
        Self {
            tcp_sec: DEFAULT_TCP_TIMEOUT_SEC,
            udp_sec: DEFAULT_UDP_TIMEOUT_SEC,
            sweep_sec: DEFAULT_SWEEP_SEC,
        }
    }
}

/// Session table resource limits.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_sessions: usize,
    pub max_memory_mb: usize,
    pub evict_threshold: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            evict_threshold: DEFAULT_EVICT_THRESHOLD,
        }
    }
}

impl ResourceLimits {
    /// `min(maxSessions, floor(maxMemoryMB * 1MiB / 2KiB))`: enforces
    /// both the count cap and the memory budget with one eviction loop.
    pub fn effective_max_sessions(&self) -> usize {
        let memory_budget_entries =
            (self.max_memory_mb * 1024 * 1024) / SESSION_MEMORY_ESTIMATE_BYTES;
        self.max_sessions.min(memory_budget_entries)
    }
}

/// Validated NAT handler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub site_id: String,
    pub virtual_ranges: Vec<VirtualRange>,
    pub rules: Vec<NatRule>,
    pub session_timeout: SessionTimeout,
    pub limits: ResourceLimits,
}

impl Config {
    /// Parse and validate a configuration from its JSON wire form.
    ///
    /// Rejects a missing/empty `siteId`, a missing `virtualNetwork` or
    /// `realNetwork` in any range, and a missing `virtualDestination`
    /// in any rule.
    pub fn from_json(data: &str) -> Result<Self> {
        let wire: ConfigWire = serde_json::from_str(data)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: ConfigWire) -> Result<Self> {
        if wire.site_id.trim().is_empty() {
            log::warn!("config rejected: siteId is required");
            return Err(Error::ConfigInvalid("siteId is required".into()));
        }

        let mut virtual_ranges = Vec::with_capacity(wire.virtual_ranges.len());
        for (i, r) in wire.virtual_ranges.into_iter().enumerate() {
            if r.virtual_network.trim().is_empty() {
                log::warn!("config rejected: virtualRanges[{i}] missing virtualNetwork");
                return Err(Error::ConfigInvalid(format!(
                    "virtualRanges[{i}]: virtualNetwork is required"
                )));
            }
            if r.real_network.trim().is_empty() {
                log::warn!("config rejected: virtualRanges[{i}] missing realNetwork");
                return Err(Error::ConfigInvalid(format!(
                    "virtualRanges[{i}]: realNetwork is required"
                )));
            }
            if r.ipv6_enabled && AddrCodecCheck::parse_cidr(&r.ipv6_prefix).is_err() {
                log::warn!("config rejected: virtualRanges[{i}] has an invalid ipv6Prefix");
                return Err(Error::ConfigInvalid(format!(
                    "virtualRanges[{i}]: ipv6Prefix is not a valid CIDR"
                )));
            }
            virtual_ranges.push(VirtualRange {
                virtual_network: r.virtual_network,
                real_network: r.real_network,
                ipv6_enabled: r.ipv6_enabled,
                ipv6_prefix: r.ipv6_prefix,
            });
        }

        let mut rules = Vec::with_capacity(wire.rules.len());
        for (i, r) in wire.rules.into_iter().enumerate() {
            if r.virtual_destination.trim().is_empty() {
                log::warn!("config rejected: rules[{i}] missing virtualDestination");
                return Err(Error::ConfigInvalid(format!(
                    "rules[{i}]: virtualDestination is required"
                )));
            }
            rules.push(NatRule {
                rule_id: r.rule_id,
                source_site: r.source_site,
                virtual_destination: r.virtual_destination,
                real_destination: r.real_destination,
                protocol: r.protocol,
                port_mapping: r.port_mapping.map(|p| PortMapping {
                    original_port: p.original_port,
                    translated_port: p.translated_port,
                }),
            });
        }

        let session_timeout = wire
            .session_timeout
            .map(|t| SessionTimeout {
                tcp_sec: t.tcp_timeout.unwrap_or(DEFAULT_TCP_TIMEOUT_SEC),
                udp_sec: t.udp_timeout.unwrap_or(DEFAULT_UDP_TIMEOUT_SEC),
                sweep_sec: t.cleanup_interval.unwrap_or(DEFAULT_SWEEP_SEC),
            })
            .unwrap_or_default();

        let limits = wire
            .resource_limits
            .map(|l| ResourceLimits {
                max_sessions: l.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
                max_memory_mb: l.max_memory_mb.unwrap_or(DEFAULT_MAX_MEMORY_MB),
                evict_threshold: l.cleanup_threshold.unwrap_or(DEFAULT_EVICT_THRESHOLD),
            })
            .unwrap_or_default();

        Ok(Config {
            site_id: wire.site_id,
            virtual_ranges,
            rules,
            session_timeout,
            limits,
        })
    }
}

/// Thin indirection so this module doesn't need to depend on the exact
/// shape of [`crate::addr::AddrCodec`] beyond CIDR parsing.
struct AddrCodecCheck;
impl AddrCodecCheck {
    fn parse_cidr(s: &str) -> Result<(), crate::error::AddrError> {
        crate::addr::AddrCodec::parse_cidr(s).map(|_| ())
    }
}
