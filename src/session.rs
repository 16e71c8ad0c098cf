//! Concurrent session table: creation, LRU eviction, and idle sweep.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{ResourceLimits, SessionTimeout};
use crate::endpoint::{Endpoint, Network};
use crate::error::{Error, Result};

/// Opaque session identifier, unique among concurrently-live sessions.
/// Never reused while its session is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// A single live NAT session: the client-facing and real-facing
/// endpoints it bridges, plus activity counters consulted by the sweep.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub client: Endpoint,
    pub virtual_dest: Endpoint,
    pub real_dest: Endpoint,
    pub rule_id: String,
    pub network: Network,
    pub created_at_secs: u64,
    last_active_secs: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Session {
    pub fn last_active_secs(&self) -> u64 {
        self.last_active_secs.load(Ordering::Relaxed)
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn record_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_active_secs.store(now_secs(), Ordering::Relaxed);
    }
}

/// Parameters for [`SessionTable::create`].
pub struct NewSession {
    pub client: Endpoint,
    pub virtual_dest: Endpoint,
    pub real_dest: Endpoint,
    pub rule_id: String,
    pub network: Network,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Concurrent session table. Entries live in a [`DashMap`] keyed by
/// [`SessionId`]; a mutex-guarded queue tracks LRU order for eviction
/// under resource pressure, independent of the idle-timeout sweep.
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<Session>>,
    lru: Mutex<VecDeque<SessionId>>,
    next_id: AtomicU64,
    limits: ResourceLimits,
    timeout: SessionTimeout,
}

impl SessionTable {
    pub fn new(limits: ResourceLimits, timeout: SessionTimeout) -> Self {
        Self {
            sessions: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            limits,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn effective_max(&self) -> usize {
        self.limits.effective_max_sessions()
    }

    /// Admit a new session, evicting least-recently-used entries if
    /// necessary so the table never exceeds `effectiveMaxSessions`. A
    /// cap of zero admits nothing: every flow gets `ResourceExhausted`.
    pub fn create(&self, new: NewSession) -> Result<Arc<Session>> {
        let cap = self.effective_max();
        {
            let mut lru = self.lru.lock();
            while self.sessions.len() >= cap {
                let Some(oldest) = lru.pop_front() else {
                    break;
                };
                self.sessions.remove(&oldest);
            }
        }

        if self.sessions.len() >= cap {
            return Err(Error::ResourceExhausted);
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session {
            id,
            client: new.client,
            virtual_dest: new.virtual_dest,
            real_dest: new.real_dest,
            rule_id: new.rule_id,
            network: new.network,
            created_at_secs: now_secs(),
            last_active_secs: AtomicU64::new(now_secs()),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        });

        self.sessions.insert(id, session.clone());
        self.lru.lock().push_back(id);
        log::debug!(
            "session {id} created: {} -> {}",
            session.virtual_dest.address,
            session.real_dest.address
        );
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    /// Mark `id` as most-recently-used, refreshing its LRU position.
    pub fn touch(&self, id: SessionId) {
        let Some(entry) = self.sessions.get(&id) else {
            return;
        };
        entry.value().touch();
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|&x| x == id) {
            lru.remove(pos);
        }
        lru.push_back(id);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, v)| v);
        if removed.is_some() {
            let mut lru = self.lru.lock();
            if let Some(pos) = lru.iter().position(|&x| x == id) {
                lru.remove(pos);
            }
            log::debug!("session {id} removed");
        }
        removed
    }

    fn timeout_for(&self, network: Network) -> u64 {
        match network {
            Network::Tcp => self.timeout.tcp_sec as u64,
            Network::Udp => self.timeout.udp_sec as u64,
        }
    }

    /// Remove sessions idle past their network's timeout, then, if the
    /// table still sits above the soft eviction threshold, evict
    /// least-recently-used entries down to it. Returns the number of
    /// sessions removed.
    pub fn sweep(&self) -> usize {
        let now = now_secs();
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            let idle = now.saturating_sub(session.last_active_secs());
            if idle >= self.timeout_for(session.network) {
                expired.push(session.id);
            }
        }
        let mut removed = expired.len();
        for id in expired {
            self.remove(id);
        }

        let cap = self.effective_max();
        let soft_limit = ((cap as f64) * self.limits.evict_threshold).floor() as usize;
        while self.sessions.len() > soft_limit.max(1).min(cap) {
            let oldest = {
                let mut lru = self.lru.lock();
                lru.pop_front()
            };
            match oldest {
                Some(id) => {
                    if self.sessions.remove(&id).is_some() {
                        removed += 1;
                    }
                }
                None => break,
            }
        }
        if removed > 0 {
            log::debug!("sweep removed {removed} session(s), {} remain", self.sessions.len());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ep(addr: &str, port: u16, network: Network) -> Endpoint {
        Endpoint::new(addr.parse::<IpAddr>().unwrap(), port, network)
    }

    fn new_session(n: u16) -> NewSession {
        NewSession {
            client: ep("10.0.0.1", n, Network::Tcp),
            virtual_dest: ep("240.2.2.20", 80, Network::Tcp),
            real_dest: ep("192.168.1.20", 80, Network::Tcp),
            rule_id: "r1".to_string(),
            network: Network::Tcp,
        }
    }

    #[test]
    fn test_create_get_remove() {
        let table = SessionTable::new(ResourceLimits::default(), SessionTimeout::default());
        let session = table.create(new_session(1)).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get(session.id).is_some());
        table.remove(session.id);
        assert_eq!(table.len(), 0);
        assert!(table.get(session.id).is_none());
    }

    #[test]
    fn test_zero_max_sessions_rejects_every_flow() {
        let limits = ResourceLimits {
            max_sessions: 0,
            max_memory_mb: 100,
            evict_threshold: 0.8,
        };
        let table = SessionTable::new(limits, SessionTimeout::default());
        assert!(matches!(
            table.create(new_session(1)),
            Err(Error::ResourceExhausted)
        ));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_lru_eviction_under_hard_cap() {
        let limits = ResourceLimits {
            max_sessions: 2,
            max_memory_mb: 100,
            evict_threshold: 0.8,
        };
        let table = SessionTable::new(limits, SessionTimeout::default());
        let s1 = table.create(new_session(1)).unwrap();
        let _s2 = table.create(new_session(2)).unwrap();
        assert_eq!(table.len(), 2);

        // Admitting a third session evicts the least-recently-used (s1).
        let _s3 = table.create(new_session(3)).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.get(s1.id).is_none());
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let limits = ResourceLimits {
            max_sessions: 2,
            max_memory_mb: 100,
            evict_threshold: 0.8,
        };
        let table = SessionTable::new(limits, SessionTimeout::default());
        let s1 = table.create(new_session(1)).unwrap();
        let s2 = table.create(new_session(2)).unwrap();
        // Touching s1 makes s2 the LRU victim instead.
        table.touch(s1.id);
        let _s3 = table.create(new_session(3)).unwrap();
        assert!(table.get(s1.id).is_some());
        assert!(table.get(s2.id).is_none());
    }

    #[test]
    fn test_sweep_removes_idle_sessions() {
        let timeout = SessionTimeout {
            tcp_sec: 0,
            udp_sec: 0,
            sweep_sec: 1,
        };
        let table = SessionTable::new(ResourceLimits::default(), timeout);
        table.create(new_session(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let removed = table.sweep();
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_session_ids_unique_while_live() {
        let table = SessionTable::new(ResourceLimits::default(), SessionTimeout::default());
        let s1 = table.create(new_session(1)).unwrap();
        let s2 = table.create(new_session(2)).unwrap();
        assert_ne!(s1.id, s2.id);
    }

    #[test]
    fn test_byte_counters_and_touch() {
        let table = SessionTable::new(ResourceLimits::default(), SessionTimeout::default());
        let session = table.create(new_session(1)).unwrap();
        session.record_up(100);
        session.record_down(200);
        assert_eq!(session.bytes_up(), 100);
        assert_eq!(session.bytes_down(), 200);
    }
}
