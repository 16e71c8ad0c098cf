//! Outbound flow pipeline: dial, bidirectional copy, and guaranteed
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::io::{self, AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::session::{Session, SessionTable};

/// Marker trait for a full-duplex byte stream to a real destination,
/// the object-safe surface [`Dialer`] returns.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// Establishes outbound connections to real destinations. Implemented
/// by the platform's transport layer; this crate only drives it.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dest: &Endpoint) -> io::Result<Box<dyn DuplexStream>>;
}

/// Dial retry policy, translated into a [`backoff::ExponentialBackoff`].
#[derive(Debug, Clone, Copy)]
pub struct DialPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Duration::from_secs(15),
        }
    }
}

/// Drives one outbound flow end to end: dial with retry, bridge the
/// client and real connections, and guarantee session/connection
/// teardown no matter which side closes first.
pub struct FlowPipeline {
    dialer: Arc<dyn Dialer>,
    sessions: Arc<SessionTable>,
    dial_policy: DialPolicy,
}

impl FlowPipeline {
    pub fn new(dialer: Arc<dyn Dialer>, sessions: Arc<SessionTable>) -> Self {
        Self {
            dialer,
            sessions,
            dial_policy: DialPolicy::default(),
        }
    }

    pub fn with_dial_policy(mut self, policy: DialPolicy) -> Self {
        self.dial_policy = policy;
        self
    }

    /// Run one flow: dial `real_dest`, then bridge `client` to it until
    /// either side closes or errors. The session is removed from the
    /// table when the flow ends, regardless of outcome.
    pub async fn run(
        &self,
        client: Box<dyn DuplexStream>,
        session: Arc<Session>,
    ) -> Result<()> {
        let result = self.run_inner(client, &session).await;
        self.sessions.remove(session.id);
        result
    }

    async fn run_inner(&self, client: Box<dyn DuplexStream>, session: &Arc<Session>) -> Result<()> {
        let real = self.dial_with_retry(&session.real_dest).await?;

        let (mut client_read, mut client_write) = io::split(client);
        let (mut real_read, mut real_write) = io::split(real);

        let up_session = session.clone();
        let mut upstream = tokio::spawn(async move {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = match io::AsyncReadExt::read(&mut client_read, &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if io::AsyncWriteExt::write_all(&mut real_write, &buf[..n])
                    .await
                    .is_err()
                {
                    break;
                }
                up_session.record_up(n as u64);
            }
            let _ = io::AsyncWriteExt::shutdown(&mut real_write).await;
        });

        let down_session = session.clone();
        let mut downstream = tokio::spawn(async move {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = match io::AsyncReadExt::read(&mut real_read, &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if io::AsyncWriteExt::write_all(&mut client_write, &buf[..n])
                    .await
                    .is_err()
                {
                    break;
                }
                down_session.record_down(n as u64);
            }
            let _ = io::AsyncWriteExt::shutdown(&mut client_write).await;
        });

        // Either direction closing ends the flow; abort the other so
        // neither task outlives the session it belongs to.
        tokio::select! {
            _ = &mut upstream => { downstream.abort(); let _ = downstream.await; }
            _ = &mut downstream => { upstream.abort(); let _ = upstream.await; }
        }

        Ok(())
    }

    async fn dial_with_retry(&self, dest: &Endpoint) -> Result<Box<dyn DuplexStream>> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.dial_policy.initial_interval,
            max_interval: self.dial_policy.max_interval,
            max_elapsed_time: Some(self.dial_policy.max_elapsed_time),
            ..ExponentialBackoff::default()
        };

        let mut last_err = None;
        loop {
            match self.dialer.dial(dest).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    match backoff.next_backoff() {
                        Some(delay) => {
                            log::warn!("dial to {} failed: {e}, retrying in {delay:?}", dest.address);
                            last_err = Some(e);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            last_err = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        log::error!("dial to {} exhausted retries", dest.address);
        Err(Error::DialFailed(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}
