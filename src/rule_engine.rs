//! Virtual-destination rule and range matching.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quick_cache::sync::Cache;

use crate::addr::AddrCodec;
use crate::config::{Config, NatRule};
use crate::endpoint::{Endpoint, Network, PortSpec};

/// Default capacity of the resolution cache.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Resolves a flow destination against a [`Config`]'s rules and virtual
/// ranges, in priority order: explicit rules first (in declaration
/// order), then ranges, synthesizing a transient "dynamic-range" rule
/// on a range match.
pub struct RuleEngine {
    config: Arc<Config>,
    /// Resolution cache. A pure performance layer: `resolve` is
    /// deterministic regardless of cache state.
    cache: Cache<u64, Option<Arc<NatRule>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl RuleEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            cache: Cache::new(DEFAULT_CACHE_CAPACITY),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Swap in a new configuration snapshot, invalidating the cache.
    pub fn set_config(&mut self, config: Arc<Config>) {
        self.config = config;
        self.cache.clear();
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Resolve `dest` against the current config. Returns the matched
    /// rule (explicit or synthesized from a range) or `None` for
    /// pass-through.
    pub fn resolve(&self, dest: &Endpoint) -> Option<Arc<NatRule>> {
        let key = cache_key(&self.config.site_id, dest);
        if let Some(cached) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let result = self.resolve_uncached(dest);
        self.cache.insert(key, result.clone());
        result
    }

    fn resolve_uncached(&self, dest: &Endpoint) -> Option<Arc<NatRule>> {
        for rule in &self.config.rules {
            if matches_virtual_destination(&rule.virtual_destination, dest)
                && matches_protocol(&rule.protocol, dest.network)
                && matches_port(rule, dest.port)
                && matches_site(&rule.source_site, &self.config.site_id)
            {
                return Some(Arc::new(rule.clone()));
            }
        }

        for range in &self.config.virtual_ranges {
            let in_virtual_network = AddrCodec::parse_cidr(&range.virtual_network)
                .map(|net| AddrCodec::contains_ip(&net, &dest.address))
                .unwrap_or(false);

            let in_real_via_embedded_v4 = range.ipv6_enabled
                && AddrCodec::extract_embedded_v4(&dest.address.to_string())
                    .and_then(|v4| {
                        AddrCodec::parse_cidr(&range.real_network)
                            .ok()
                            .map(|net| AddrCodec::contains_ip(&net, &IpAddr::V4(v4)))
                    })
                    .unwrap_or(false);

            if in_virtual_network || in_real_via_embedded_v4 {
                return Some(Arc::new(NatRule {
                    rule_id: format!("dynamic-range-{}", range.virtual_network),
                    source_site: String::new(),
                    virtual_destination: dest.address.to_string(),
                    real_destination: range.real_network.clone(),
                    protocol: "tcp,udp".to_string(),
                    port_mapping: None,
                }));
            }
        }

        log::debug!("no rule or range matched {}, passing through", dest.address);
        None
    }

    /// Cache hit rate, `NaN` if never queried.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            f64::NAN
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

fn cache_key(site_id: &str, dest: &Endpoint) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    site_id.hash(&mut hasher);
    dest.hash(&mut hasher);
    hasher.finish()
}

fn matches_virtual_destination(rule_dest: &str, dest: &Endpoint) -> bool {
    if rule_dest.contains('/') {
        return AddrCodec::parse_cidr(rule_dest)
            .map(|net| AddrCodec::contains_ip(&net, &dest.address))
            .unwrap_or(false);
    }

    if rule_dest.contains(':') && rule_dest.contains('.') {
        let rule_v4 = AddrCodec::extract_embedded_v4(rule_dest);
        let dest_v4 = match dest.address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => AddrCodec::extract_embedded_v4(&dest.address.to_string()),
        };
        return matches!((rule_v4, dest_v4), (Some(a), Some(b)) if a == b);
    }

    rule_dest
        .parse::<IpAddr>()
        .map(|addr| addr == dest.address)
        .unwrap_or(false)
}

fn matches_protocol(rule_protocol: &str, network: Network) -> bool {
    let rule_protocol = rule_protocol.trim();
    if rule_protocol.is_empty() {
        return true;
    }
    rule_protocol
        .split(',')
        .any(|p| p.trim().eq_ignore_ascii_case(network.as_str()))
}

fn matches_port(rule: &NatRule, port: u16) -> bool {
    let Some(mapping) = &rule.port_mapping else {
        return true;
    };
    PortSpec::parse(&mapping.original_port)
        .map(|spec| spec.contains(port))
        .unwrap_or(true)
}

fn matches_site(rule_source_site: &str, config_site_id: &str) -> bool {
    if rule_source_site.trim().is_empty() || config_site_id.trim().is_empty() {
        return true;
    }
    rule_source_site
        .split(',')
        .any(|s| s.trim().eq_ignore_ascii_case(config_site_id.trim()))
}
