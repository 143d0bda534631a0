//! Guest → host forwarding planes.
//!
//! One forwarder per transport: TCP dials out through the proxy manager,
//! UDP keeps a conntrack of external sockets, ICMP echo proxies through
//! unprivileged ICMP sockets. All three translate host-side failures back
//! into guest-visible protocol events (RST, ICMP unreachable, silence).

pub mod icmp;
pub mod tcp;
pub mod udp;

use std::io;

/// Classification of a failed outbound dial or send, per the error grammar:
/// transient failures become RSTs, unreachable networks become ICMP errors,
/// everything else completes silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialFailure {
    /// `ECONNREFUSED` / `ECONNRESET` → complete with RST.
    Refused,
    /// `ENETUNREACH` → ICMP net unreachable, no RST.
    NetUnreachable,
    /// `EHOSTUNREACH` / `EHOSTDOWN` → ICMP host unreachable, no RST.
    HostUnreachable,
    /// `ETIMEDOUT`, deadline exceeded, anything else → silent.
    Other,
}

pub fn classify_dial_error(err: &io::Error) -> DialFailure {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            return DialFailure::Refused;
        }
        io::ErrorKind::TimedOut => return DialFailure::Other,
        _ => {}
    }
    match err.raw_os_error() {
        Some(code) if code == libc::ENETUNREACH => DialFailure::NetUnreachable,
        Some(code) if code == libc::EHOSTUNREACH || code == libc::EHOSTDOWN => {
            DialFailure::HostUnreachable
        }
        Some(code) if code == libc::ECONNREFUSED || code == libc::ECONNRESET => {
            DialFailure::Refused
        }
        _ => DialFailure::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert_eq!(
            classify_dial_error(&io::Error::from_raw_os_error(libc::ECONNREFUSED)),
            DialFailure::Refused
        );
        assert_eq!(
            classify_dial_error(&io::Error::from_raw_os_error(libc::ECONNRESET)),
            DialFailure::Refused
        );
        assert_eq!(
            classify_dial_error(&io::Error::from_raw_os_error(libc::ENETUNREACH)),
            DialFailure::NetUnreachable
        );
        assert_eq!(
            classify_dial_error(&io::Error::from_raw_os_error(libc::EHOSTUNREACH)),
            DialFailure::HostUnreachable
        );
        assert_eq!(
            classify_dial_error(&io::Error::from_raw_os_error(libc::EHOSTDOWN)),
            DialFailure::HostUnreachable
        );
        assert_eq!(
            classify_dial_error(&io::Error::from_raw_os_error(libc::ETIMEDOUT)),
            DialFailure::Other
        );
        assert_eq!(
            classify_dial_error(&io::Error::new(io::ErrorKind::Other, "deadline")),
            DialFailure::Other
        );
    }
}
