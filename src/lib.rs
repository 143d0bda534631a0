//! User-space virtual network gateway for Linux guests on macOS hosts.
//!
//! The gateway sits between a Linux guest (speaking Ethernet over a datagram
//! socket pair with the hypervisor) and the host's network stack. It
//! terminates layer-2 frames, runs a user-space TCP/IP plane on the host
//! side, and transparently forwards the guest's IP traffic (TCP, UDP, and
//! ICMP echo) while exposing in-stack services (DNS, NTP, host-control RPC,
//! SSH-agent proxy) and bidirectional port-forward surfaces.
//!
//! # Example: bring up a gateway over a socket pair
//!
//! ```no_run
//! use vnet_gateway::{Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (host_side, _guest_side) = tokio::net::UnixDatagram::pair()?;
//!     let gateway = Gateway::builder(GatewayConfig::default())
//!         .datagram_link(host_side)
//!         .build()?;
//!     let handle = gateway.start().await?;
//!     handle.wait().await;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod link;
pub mod nat;
pub mod stack;

// Forwarding planes
pub mod forward;
pub mod hostfwd;
pub mod proxy;

// In-stack services and control surfaces
pub mod control;
pub mod power;
pub mod services;

// Top-level owner
pub mod gateway;

// Re-exports for convenience
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayConfig, GatewayHandle};

// Prelude for common imports
pub mod prelude {
    pub use crate::config::ConfigStore;
    pub use crate::error::{Error, Result};
    pub use crate::gateway::{Gateway, GatewayConfig, GatewayHandle};
    pub use crate::hostfwd::ForwardRouter;
    pub use crate::proxy::ProxyManager;
    pub use gateway_protocol::forward::ForwardSpec;
    pub use gateway_protocol::{NetworkProxy, VmConfig, VmConfigPatch};
}
