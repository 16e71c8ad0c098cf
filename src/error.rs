//! Error types for the NAT outbound handler.

use thiserror::Error;

/// Error type for NAT handler operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed validation at Init.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A rule or destination address failed to parse to a usable address.
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    /// The ambient flow context carried no destination.
    #[error("flow has no outbound destination")]
    NoOutbound,

    /// The destination is not an IP address.
    #[error("unsupported address family for {0}")]
    UnsupportedFamily(String),

    /// All dial retry attempts were exhausted.
    #[error("dial failed after retries: {0}")]
    DialFailed(String),

    /// The session table could not admit the flow even after eviction.
    #[error("session table exhausted")]
    ResourceExhausted,

    /// An I/O error occurred while streaming.
    #[error("copy error: {0}")]
    CopyError(#[from] std::io::Error),

    /// JSON config failed to parse.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Result type alias for NAT handler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for CIDR/address parsing in [`crate::addr`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// Invalid CIDR notation.
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// Invalid IP address notation.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),
}

/// Error type for port-spec parsing in [`crate::endpoint`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortSpecError {
    /// Port spec did not parse as a single port, a range, or "any".
    #[error("invalid port spec: {0}")]
    InvalidPortSpec(String),
}
