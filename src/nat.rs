//! Static NAT table: virtual host addresses → host loopback.
//!
//! Populated once at init, read under a shared lock by the TCP, UDP, and
//! ICMP forward paths. The only rewrites are the two host-NAT aliases; the
//! table exists so the lookup discipline (and its lock) sits in one place.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::RwLock;

use crate::stack::{HOST_NAT4, HOST_NAT6};

pub struct NatTable {
    map: RwLock<HashMap<IpAddr, IpAddr>>,
}

impl NatTable {
    /// The standard table: v4 host-NAT → 127.0.0.1, v6 host-NAT → ::1.
    pub fn with_host_nat() -> Self {
        let mut map = HashMap::new();
        map.insert(
            IpAddr::V4(HOST_NAT4),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        map.insert(
            IpAddr::V6(HOST_NAT6),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        );
        Self {
            map: RwLock::new(map),
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<IpAddr> {
        self.map.read().expect("nat table poisoned").get(&ip).copied()
    }

    /// Rewrite a destination if it is a virtual host address. The bool is
    /// true when a rewrite happened, which gates the alternate-loopback
    /// retry on refused dials.
    pub fn rewrite(&self, addr: SocketAddr) -> (SocketAddr, bool) {
        match self.lookup(addr.ip()) {
            Some(mapped) => (SocketAddr::new(mapped, addr.port()), true),
            None => (addr, false),
        }
    }

    /// Map a host address back to the virtual alias the guest dialed, for
    /// presenting replies and ICMP errors on the virtual wire.
    pub fn inverse(&self, ip: IpAddr) -> Option<IpAddr> {
        self.map
            .read()
            .expect("nat table poisoned")
            .iter()
            .find(|(_, host)| **host == ip)
            .map(|(virtual_ip, _)| *virtual_ip)
    }
}

/// The other family's loopback with the same port, for the one-shot retry
/// after a refused host-NAT dial.
pub fn alternate_loopback(addr: SocketAddr) -> Option<SocketAddr> {
    match addr.ip() {
        IpAddr::V4(v4) if v4 == Ipv4Addr::LOCALHOST => Some(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            addr.port(),
        )),
        IpAddr::V6(v6) if v6 == Ipv6Addr::LOCALHOST => Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            addr.port(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_nat_entries_present() {
        let nat = NatTable::with_host_nat();
        assert_eq!(
            nat.lookup(IpAddr::V4(HOST_NAT4)),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(
            nat.lookup(IpAddr::V6(HOST_NAT6)),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(nat.lookup("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn rewrite_keeps_port() {
        let nat = NatTable::with_host_nat();
        let (addr, mapped) = nat.rewrite(SocketAddr::new(IpAddr::V4(HOST_NAT4), 8080));
        assert!(mapped);
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());

        let external: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let (addr, mapped) = nat.rewrite(external);
        assert!(!mapped);
        assert_eq!(addr, external);
    }

    #[test]
    fn alternate_loopback_flips_family() {
        assert_eq!(
            alternate_loopback("127.0.0.1:80".parse().unwrap()),
            Some("[::1]:80".parse().unwrap())
        );
        assert_eq!(
            alternate_loopback("[::1]:80".parse().unwrap()),
            Some("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(alternate_loopback("10.0.0.1:80".parse().unwrap()), None);
    }
}
