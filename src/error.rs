//! Error types for the gateway

use thiserror::Error;

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in gateway operations
#[derive(Error, Debug)]
pub enum Error {
    /// Link endpoint errors (socket pair, framing, pcap)
    #[error("link error: {0}")]
    Link(String),

    /// User-space stack errors
    #[error("stack error: {0}")]
    Stack(String),

    /// Forwarder errors (TCP/UDP/ICMP paths)
    #[error("forward error: {0}")]
    Forward(String),

    /// Proxy manager errors
    #[error("proxy error: {0}")]
    Proxy(String),

    /// In-stack service errors (DNS, NTP, host-control, ssh-agent)
    #[error("service error: {0}")]
    Service(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// VM-control RPC errors
    #[error("control error: {0}")]
    Control(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("timeout: {0}")]
    Timeout(String),

    /// Gateway is not running
    #[error("gateway is not running")]
    NotRunning,

    /// Gateway is already running
    #[error("gateway is already running")]
    AlreadyRunning,

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Protocol wire-format errors
    #[error("protocol error: {0}")]
    Protocol(#[from] gateway_protocol::ProtocolError),

    /// DNS resolution errors
    #[error("resolver error: {0}")]
    Resolver(#[from] hickory_resolver::error::ResolveError),
}
