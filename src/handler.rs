//! The outbound NAT handler: lifecycle, stats, and the background
//! sweep task.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::endpoint::{Endpoint, FlowTarget};
use crate::error::{Error, Result};
use crate::pipeline::{DuplexStream, Dialer, FlowPipeline};
use crate::rule_engine::RuleEngine;
use crate::session::{NewSession, SessionTable};
use crate::transform::Transformer;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Monotonic counters surfaced for observability. `active_sessions` is
/// not stored here; it is read live from the session table at snapshot
/// time since it is a gauge, not an accumulator.
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub total_sessions_created: AtomicU64,
    pub total_bytes_processed: AtomicU64,
    pub total_errors: AtomicU64,
}

impl HandlerStats {
    fn snapshot(&self, active_sessions: usize) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            active_sessions,
            total_sessions_created: self.total_sessions_created.load(Ordering::Relaxed),
            total_bytes_processed: self.total_bytes_processed.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`HandlerStats`] plus the live session
/// count, for reporting to the platform's metrics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStatsSnapshot {
    pub active_sessions: usize,
    pub total_sessions_created: u64,
    pub total_bytes_processed: u64,
    pub total_errors: u64,
}

impl fmt::Display for HandlerStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} created={} bytes={} errors={}",
            self.active_sessions, self.total_sessions_created, self.total_bytes_processed, self.total_errors
        )
    }
}

/// The bidirectional NAT outbound handler. Owns the rule engine,
/// session table, and a background sweeper; translates and forwards
/// flows through a [`FlowPipeline`] when a rule or range matches, and
/// passes flows through untouched otherwise.
pub struct Handler {
    state: AtomicU8,
    rules: RwLock<RuleEngine>,
    sessions: Arc<SessionTable>,
    pipeline: FlowPipeline,
    stats: Arc<HandlerStats>,
    sweep_interval: Duration,
    sweeper: RwLock<Option<JoinHandle<()>>>,
}

impl Handler {
    /// Construct a handler from a validated [`Config`] and a [`Dialer`]
    /// supplied by the platform. Does not start the background
    /// sweeper; call [`Self::init`] to transition to `RUNNING`.
    pub fn new(config: Config, dialer: Arc<dyn Dialer>) -> Self {
        let sweep_interval = Duration::from_secs(config.session_timeout.sweep_sec as u64);
        let sessions = Arc::new(SessionTable::new(config.limits, config.session_timeout));
        let rules = RwLock::new(RuleEngine::new(Arc::new(config)));
        Self {
            state: AtomicU8::new(STATE_UNINITIALIZED),
            rules,
            sessions: sessions.clone(),
            pipeline: FlowPipeline::new(dialer, sessions),
            stats: Arc::new(HandlerStats::default()),
            sweep_interval,
            sweeper: RwLock::new(None),
        }
    }

    /// Transition `UNINITIALIZED -> RUNNING` and start the background
    /// sweep task. A no-op if already running; an error if closed.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        match self.state.compare_exchange(
            STATE_UNINITIALIZED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(Error::ConfigInvalid("handler already closed".into())),
        }

        let sessions = self.sessions.clone();
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                log::debug!("sweeper tick: {} active sessions before sweep", sessions.len());
                sessions.sweep();
            }
        });
        *self.sweeper.write() = Some(handle);
        Ok(())
    }

    /// Transition to `CLOSED`, stopping the sweeper. Idempotent.
    pub fn close(&self) {
        if self
            .state
            .swap(STATE_CLOSED, Ordering::SeqCst)
            == STATE_CLOSED
        {
            return;
        }
        if let Some(handle) = self.sweeper.write().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot(self.sessions.len())
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Hot-swap the configuration, invalidating the rule resolution
    /// cache. Session timeouts/limits already in effect are untouched
    /// until the next sweep cycle reads the new table configuration.
    pub fn reload_config(&self, config: Config) {
        self.rules.write().set_config(Arc::new(config));
    }

    /// Accept one inbound flow. `target` is the dispatcher's ambient
    /// view of the destination, which may carry no address at all or
    /// one that never resolved to an IP upstream; both are rejected
    /// here before rule resolution runs. Once resolved, `dest` is
    /// checked against the current rules; on a match, a session is
    /// created and driven through the pipeline. With no match, the
    /// flow passes through untranslated. This handler never originates
    /// a pass-through connection itself; that is the platform's job.
    pub async fn handle_flow(
        &self,
        client: Box<dyn DuplexStream>,
        source_addr: std::net::IpAddr,
        target: FlowTarget,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ConfigInvalid("handler is not running".into()));
        }

        let dest = match target.resolve() {
            Ok(dest) => dest,
            Err(e) => {
                log::warn!("flow rejected before rule resolution: {e}");
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let resolved = self.rules.read().resolve(&dest);
        let Some(rule) = resolved else {
            return Ok(());
        };

        let real_dest = match Transformer::dnat(&dest, &rule) {
            Ok(ep) => ep,
            Err(e) => {
                log::error!("dnat failed for rule {}: {e}", rule.rule_id);
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let client_endpoint = Endpoint::new(source_addr, dest.port, dest.network);
        let session = match self.sessions.create(NewSession {
            client: client_endpoint,
            virtual_dest: dest,
            real_dest,
            rule_id: rule.rule_id.clone(),
            network: dest.network,
        }) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("session admission failed for rule {}: {e}", rule.rule_id);
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.stats.total_sessions_created.fetch_add(1, Ordering::Relaxed);

        let result = self.pipeline.run(client, session.clone()).await;
        self.stats
            .total_bytes_processed
            .fetch_add(session.bytes_up() + session.bytes_down(), Ordering::Relaxed);
        if result.is_err() {
            self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::endpoint::Network;
    use async_trait::async_trait;
    use std::io;
    use tokio::io::duplex;

    struct EchoDialer;

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(&self, _dest: &Endpoint) -> io::Result<Box<dyn DuplexStream>> {
            let (near, _far) = duplex(64);
            Ok(Box::new(near))
        }
    }

    fn config(json: &str) -> Config {
        Config::from_json(json).unwrap()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let handler = Arc::new(Handler::new(
            config(r#"{ "siteId": "site-b" }"#),
            Arc::new(EchoDialer),
        ));
        assert!(!handler.is_running());
        handler.init().unwrap();
        assert!(handler.is_running());
        handler.close();
        assert!(!handler.is_running());
        // Re-init after close is rejected.
        assert!(handler.init().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let handler = Arc::new(Handler::new(
            config(r#"{ "siteId": "site-b" }"#),
            Arc::new(EchoDialer),
        ));
        handler.init().unwrap();
        handler.init().unwrap();
        assert!(handler.is_running());
    }

    #[tokio::test]
    async fn test_handle_flow_passthrough_with_no_rule_match() {
        let handler = Arc::new(Handler::new(
            config(r#"{ "siteId": "site-b" }"#),
            Arc::new(EchoDialer),
        ));
        handler.init().unwrap();
        let (client, _far) = duplex(64);
        let target = FlowTarget::new("8.8.8.8", 443, Network::Tcp);
        let result = handler
            .handle_flow(Box::new(client), "10.0.0.5".parse().unwrap(), target)
            .await;
        assert!(result.is_ok());
        assert_eq!(handler.stats().total_sessions_created, 0);
        assert_eq!(handler.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_handle_flow_rejects_when_not_running() {
        let handler = Handler::new(config(r#"{ "siteId": "site-b" }"#), Arc::new(EchoDialer));
        let (client, _far) = duplex(64);
        let target = FlowTarget::new("8.8.8.8", 443, Network::Tcp);
        let result = handler
            .handle_flow(Box::new(client), "10.0.0.5".parse().unwrap(), target)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handle_flow_with_no_destination_is_no_outbound() {
        let handler = Arc::new(Handler::new(
            config(r#"{ "siteId": "site-b" }"#),
            Arc::new(EchoDialer),
        ));
        handler.init().unwrap();
        let (client, _far) = duplex(64);
        let target = FlowTarget::none(443, Network::Tcp);
        let result = handler
            .handle_flow(Box::new(client), "10.0.0.5".parse().unwrap(), target)
            .await;
        assert!(matches!(result, Err(Error::NoOutbound)));
        assert_eq!(handler.stats().total_errors, 1);
    }

    #[tokio::test]
    async fn test_handle_flow_with_unresolved_hostname_is_unsupported_family() {
        let handler = Arc::new(Handler::new(
            config(r#"{ "siteId": "site-b" }"#),
            Arc::new(EchoDialer),
        ));
        handler.init().unwrap();
        let (client, _far) = duplex(64);
        let target = FlowTarget::new("example.com", 443, Network::Tcp);
        let result = handler
            .handle_flow(Box::new(client), "10.0.0.5".parse().unwrap(), target)
            .await;
        assert!(matches!(result, Err(Error::UnsupportedFamily(_))));
        assert_eq!(handler.stats().total_errors, 1);
    }

    #[tokio::test]
    async fn test_handle_flow_translates_and_creates_session() {
        let handler = Arc::new(Handler::new(
            config(
                r#"{
                "siteId": "site-b",
                "rules": [{
                    "ruleId": "r1",
                    "virtualDestination": "240.2.2.20",
                    "realDestination": "192.168.1.20",
                    "protocol": "tcp"
                }]
            }"#,
            ),
            Arc::new(EchoDialer),
        ));
        handler.init().unwrap();
        let (client, _far) = duplex(64);
        let target = FlowTarget::new("240.2.2.20", 80, Network::Tcp);
        let result = handler
            .handle_flow(Box::new(client), "10.0.0.5".parse().unwrap(), target)
            .await;
        assert!(result.is_ok());
        assert_eq!(handler.stats().total_sessions_created, 1);
        // The pipeline removes the session once the flow ends.
        assert_eq!(handler.sessions().len(), 0);
        assert_eq!(handler.stats().active_sessions, 0);
    }
}
