//! natgate - a bidirectional NAT outbound handler for multi-protocol
//! traffic forwarding.
//!
//! A site advertises virtual (NAT64-style) address ranges and a set of
//! NAT rules mapping virtual destinations to real ones. This crate
//! resolves an outbound flow's destination against that configuration,
//! rewrites it (DNAT), tracks the resulting session, and drives the
//! bidirectional byte copy between client and real destination.
//!
//! # Quick Start
//!
//! ```ignore
//! use natgate::config::Config;
//! use natgate::handler::Handler;
//! use std::sync::Arc;
//!
//! let config = Config::from_json(config_json)?;
//! let handler = Arc::new(Handler::new(config, dialer));
//! handler.init()?;
//!
//! handler.handle_flow(client_stream, source_addr, target).await?;
//! ```
//!
//! # Modules
//!
//! - [`addr`]: RFC 6052 CIDR and embedded-IPv4 address handling.
//! - [`endpoint`]: Flow endpoints, transport networks, port specs.
//! - [`config`]: Validated configuration surface.
//! - [`rule_engine`]: Virtual-destination rule/range resolution.
//! - [`transform`]: DNAT destination rewriting.
//! - [`session`]: Concurrent session table with LRU and idle eviction.
//! - [`pipeline`]: Dial-retry and bidirectional copy for one flow.
//! - [`handler`]: Handler lifecycle, stats, and the background sweeper.

pub mod addr;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod rule_engine;
pub mod session;
pub mod transform;

pub use addr::{AddrClass, AddrCodec};
pub use config::{Config, NatRule, PortMapping, ResourceLimits, SessionTimeout, VirtualRange};
pub use endpoint::{Endpoint, FlowTarget, Network, PortMap, PortSpec};
pub use error::{Error, Result};
pub use handler::{Handler, HandlerStats, HandlerStatsSnapshot};
pub use pipeline::{DialPolicy, Dialer, DuplexStream, FlowPipeline};
pub use rule_engine::RuleEngine;
pub use session::{Session, SessionId, SessionTable};
pub use transform::Transformer;
