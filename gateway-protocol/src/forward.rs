//! Host-forward spec grammar.
//!
//! A forward spec pairs a host-side listen endpoint with a guest-side
//! target:
//!
//! ```text
//! "{tcp|udp|unix}:{addr|path}" -> "{tcp|udp|vsock}:{port}"
//! ```
//!
//! Examples:
//! - `tcp:127.0.0.1:2222` -> `tcp:22`
//! - `unix:/path/to/docker.sock` -> `tcp:2375`
//! - `tcp:127.0.0.1:62429` -> `vsock:2049`
//!
//! Specs are unique by their `from` endpoint; registration and the
//! `StartForward` RPC both speak this grammar.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Host-side listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum ListenEndpoint {
    Tcp { addr: SocketAddr },
    Udp { addr: SocketAddr },
    Unix { path: PathBuf },
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEndpoint::Tcp { addr } => write!(f, "tcp:{}", addr),
            ListenEndpoint::Udp { addr } => write!(f, "udp:{}", addr),
            ListenEndpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Guest-side target: a TCP or UDP port reached through the stack, or a
/// vsock port reached through the hypervisor-supplied dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum ForwardTarget {
    Tcp { port: u16 },
    Udp { port: u16 },
    Vsock { port: u32 },
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::Tcp { port } => write!(f, "tcp:{}", port),
            ForwardTarget::Udp { port } => write!(f, "udp:{}", port),
            ForwardTarget::Vsock { port } => write!(f, "vsock:{}", port),
        }
    }
}

/// A complete forward spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub from: ListenEndpoint,
    pub to: ForwardTarget,
}

impl ForwardSpec {
    /// Parse the two-string form used by registration and `StartForward`.
    pub fn parse(from: &str, to: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            from: from.parse()?,
            to: to.parse()?,
        })
    }

    /// Supported `(from, to)` combinations per the routing table:
    /// tcp→tcp, tcp→vsock, udp→udp, unix→tcp.
    pub fn supported(&self) -> bool {
        matches!(
            (&self.from, &self.to),
            (ListenEndpoint::Tcp { .. }, ForwardTarget::Tcp { .. })
                | (ListenEndpoint::Tcp { .. }, ForwardTarget::Vsock { .. })
                | (ListenEndpoint::Udp { .. }, ForwardTarget::Udp { .. })
                | (ListenEndpoint::Unix { .. }, ForwardTarget::Tcp { .. })
        )
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

impl FromStr for ListenEndpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, rest) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidSpec(format!("missing proto in '{}'", s)))?;
        match proto {
            "tcp" => Ok(ListenEndpoint::Tcp {
                addr: rest.parse().map_err(|_| {
                    ProtocolError::InvalidSpec(format!("bad tcp listen addr '{}'", rest))
                })?,
            }),
            "udp" => Ok(ListenEndpoint::Udp {
                addr: rest.parse().map_err(|_| {
                    ProtocolError::InvalidSpec(format!("bad udp listen addr '{}'", rest))
                })?,
            }),
            "unix" => {
                if rest.is_empty() {
                    return Err(ProtocolError::InvalidSpec("empty unix path".into()));
                }
                Ok(ListenEndpoint::Unix {
                    path: PathBuf::from(rest),
                })
            }
            other => Err(ProtocolError::InvalidSpec(format!(
                "unknown listen proto '{}'",
                other
            ))),
        }
    }
}

impl FromStr for ForwardTarget {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, rest) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidSpec(format!("missing proto in '{}'", s)))?;
        match proto {
            "tcp" => Ok(ForwardTarget::Tcp {
                port: rest.parse().map_err(|_| {
                    ProtocolError::InvalidSpec(format!("bad tcp port '{}'", rest))
                })?,
            }),
            "udp" => Ok(ForwardTarget::Udp {
                port: rest.parse().map_err(|_| {
                    ProtocolError::InvalidSpec(format!("bad udp port '{}'", rest))
                })?,
            }),
            "vsock" => Ok(ForwardTarget::Vsock {
                port: rest.parse().map_err(|_| {
                    ProtocolError::InvalidSpec(format!("bad vsock port '{}'", rest))
                })?,
            }),
            other => Err(ProtocolError::InvalidSpec(format!(
                "unknown target proto '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_examples() {
        let spec = ForwardSpec::parse("tcp:127.0.0.1:2222", "tcp:22").unwrap();
        assert!(spec.supported());
        assert_eq!(spec.to_string(), "tcp:127.0.0.1:2222 -> tcp:22");

        let spec = ForwardSpec::parse("unix:/run/docker.sock", "tcp:2375").unwrap();
        assert!(spec.supported());

        let spec = ForwardSpec::parse("tcp:127.0.0.1:62429", "vsock:2049").unwrap();
        assert!(spec.supported());
    }

    #[test]
    fn rejects_bad_grammar() {
        assert!(ForwardSpec::parse("tcp:no-port", "tcp:22").is_err());
        assert!(ForwardSpec::parse("sctp:127.0.0.1:1", "tcp:22").is_err());
        assert!(ForwardSpec::parse("unix:", "tcp:22").is_err());
        assert!(ForwardSpec::parse("tcp:127.0.0.1:1", "vsock:notaport").is_err());
    }

    #[test]
    fn unsupported_combinations() {
        let spec = ForwardSpec::parse("udp:127.0.0.1:53", "tcp:53").unwrap();
        assert!(!spec.supported());
        let spec = ForwardSpec::parse("unix:/tmp/x.sock", "vsock:1").unwrap();
        assert!(!spec.supported());
    }
}
