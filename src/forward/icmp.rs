//! ICMP echo proxying through unprivileged ICMP sockets.
//!
//! Outbound echo requests from the guest are written to `SOCK_DGRAM`
//! ICMP/ICMPv6 sockets with the guest's TTL and TOS applied; replies are
//! delivered to a per-family "last source" slot. This is deliberately
//! stateless per flow: concurrent pings from several guest processes can
//! cross-deliver, and the guest-side NAT discards the strays.
//!
//! Nested payloads in Destination Unreachable / Time Exceeded replies are
//! rewritten through the UDP conntrack reverse map so the guest's conntrack
//! can match the error to the flow that caused it. Malformed replies are
//! common in the wild; every parse failure drops exactly one packet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use smoltcp::wire::{Icmpv4DstUnreachable, Icmpv6DstUnreachable, Ipv4Repr, Ipv6Repr, IpProtocol};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use super::udp::UdpReverseMap;
use crate::nat::NatTable;
use crate::stack::{frames, EchoMeta, IcmpProxy, StackHandle};
use crate::Result;

const ICMP4_ECHO_REPLY: u8 = 0;
const ICMP4_DST_UNREACHABLE: u8 = 3;
const ICMP4_TIME_EXCEEDED: u8 = 11;
const ICMP6_DST_UNREACHABLE: u8 = 1;
const ICMP6_TIME_EXCEEDED: u8 = 3;
const ICMP6_ECHO_REPLY: u8 = 129;

struct Inner {
    stack: StackHandle,
    nat: Arc<NatTable>,
    reverse: Arc<UdpReverseMap>,
    sock4: Option<Arc<UdpSocket>>,
    sock6: Option<Arc<UdpSocket>>,
    last_src4: Mutex<Option<Ipv4Addr>>,
    last_src6: Mutex<Option<Ipv6Addr>>,
    last_ttl4: AtomicU8,
    last_tos4: AtomicU8,
    last_hops6: AtomicU8,
}

pub struct IcmpForwarder {
    inner: Arc<Inner>,
}

fn open_icmp_socket(v6: bool) -> std::io::Result<UdpSocket> {
    let (domain, proto, bind): (Domain, Protocol, SocketAddr) = if v6 {
        (Domain::IPV6, Protocol::ICMPV6, "[::]:0".parse().unwrap())
    } else {
        (Domain::IPV4, Protocol::ICMPV4, "0.0.0.0:0".parse().unwrap())
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(proto))?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

impl IcmpForwarder {
    /// Opens both family sockets. A family that cannot be opened (missing
    /// `ping_group_range` on Linux, say) downgrades to dropping that
    /// family's echo traffic rather than failing the gateway.
    pub fn new(
        stack: StackHandle,
        nat: Arc<NatTable>,
        reverse: Arc<UdpReverseMap>,
    ) -> Result<Self> {
        let sock4 = match open_icmp_socket(false) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!(error = %e, "icmpv4 socket unavailable, echo disabled");
                None
            }
        };
        let sock6 = match open_icmp_socket(true) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!(error = %e, "icmpv6 socket unavailable, echo disabled");
                None
            }
        };

        let inner = Arc::new(Inner {
            stack,
            nat,
            reverse,
            sock4,
            sock6,
            last_src4: Mutex::new(None),
            last_src6: Mutex::new(None),
            last_ttl4: AtomicU8::new(0),
            last_tos4: AtomicU8::new(0),
            last_hops6: AtomicU8::new(0),
        });

        if let Some(sock) = inner.sock4.clone() {
            let inner = inner.clone();
            tokio::spawn(async move { inner.reply_loop4(sock).await });
        }
        if let Some(sock) = inner.sock6.clone() {
            let inner = inner.clone();
            tokio::spawn(async move { inner.reply_loop6(sock).await });
        }

        Ok(Self { inner })
    }
}

impl IcmpProxy for IcmpForwarder {
    fn echo_request_v4(&self, meta: EchoMeta, message: Vec<u8>) {
        if let IpAddr::V4(src) = meta.guest_src {
            *self.inner.last_src4.lock().expect("slot poisoned") = Some(src);
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.send4(meta, message).await });
    }

    fn echo_request_v6(&self, meta: EchoMeta, message: Vec<u8>) {
        if let IpAddr::V6(src) = meta.guest_src {
            *self.inner.last_src6.lock().expect("slot poisoned") = Some(src);
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.send6(meta, message).await });
    }
}

impl Inner {
    async fn send4(self: Arc<Self>, meta: EchoMeta, message: Vec<u8>) {
        let Some(sock) = &self.sock4 else { return };
        let sref = SockRef::from(sock.as_ref());
        if self.last_ttl4.swap(meta.hop_limit, Ordering::Relaxed) != meta.hop_limit {
            if let Err(e) = sref.set_ttl(meta.hop_limit as u32) {
                trace!(error = %e, "icmp ttl copy failed");
            }
        }
        if self.last_tos4.swap(meta.traffic_class, Ordering::Relaxed) != meta.traffic_class {
            if let Err(e) = sref.set_tos(meta.traffic_class as u32) {
                trace!(error = %e, "icmp tos copy failed");
            }
        }

        if let Err(e) = sock.send_to(&message, SocketAddr::new(meta.dst, 0)).await {
            self.surface_send_failure(&meta, &message, &e);
        }
    }

    async fn send6(self: Arc<Self>, meta: EchoMeta, message: Vec<u8>) {
        let Some(sock) = &self.sock6 else { return };
        if self.last_hops6.swap(meta.hop_limit, Ordering::Relaxed) != meta.hop_limit {
            let sref = SockRef::from(sock.as_ref());
            if let Err(e) = sref.set_unicast_hops_v6(meta.hop_limit as u32) {
                trace!(error = %e, "icmp hop-limit copy failed");
            }
        }

        if let Err(e) = sock.send_to(&message, SocketAddr::new(meta.dst, 0)).await {
            self.surface_send_failure(&meta, &message, &e);
        }
    }

    /// Translate a host-side send failure into an ICMP error on the virtual
    /// wire, shaped per RFC 792 / RFC 4443 (invoking header + 8 bytes).
    fn surface_send_failure(&self, meta: &EchoMeta, message: &[u8], err: &std::io::Error) {
        use super::DialFailure;
        let failure = super::classify_dial_error(err);
        let mut data = [0u8; 8];
        let take = message.len().min(8);
        data[..take].copy_from_slice(&message[..take]);

        match (meta.guest_src, meta.dst) {
            (IpAddr::V4(guest), IpAddr::V4(dst)) => {
                let reason = match failure {
                    DialFailure::NetUnreachable => Icmpv4DstUnreachable::NetUnreachable,
                    DialFailure::HostUnreachable => Icmpv4DstUnreachable::HostUnreachable,
                    _ => {
                        debug!(error = %err, "icmp send failed, dropped");
                        return;
                    }
                };
                let header = Ipv4Repr {
                    src_addr: frames::ip4(guest),
                    dst_addr: frames::ip4(dst),
                    next_header: IpProtocol::Icmp,
                    payload_len: data.len(),
                    hop_limit: meta.hop_limit,
                };
                self.stack
                    .inject_frame(frames::icmpv4_unreachable(reason, &header, &data));
            }
            (IpAddr::V6(guest), IpAddr::V6(dst)) => {
                let reason = match failure {
                    DialFailure::NetUnreachable => Icmpv6DstUnreachable::NoRoute,
                    DialFailure::HostUnreachable => Icmpv6DstUnreachable::AddrUnreachable,
                    _ => {
                        debug!(error = %err, "icmp send failed, dropped");
                        return;
                    }
                };
                let header = Ipv6Repr {
                    src_addr: frames::ip6(guest),
                    dst_addr: frames::ip6(dst),
                    next_header: IpProtocol::Icmpv6,
                    payload_len: data.len(),
                    hop_limit: meta.hop_limit,
                };
                self.stack
                    .inject_frame(frames::icmpv6_unreachable(reason, &header, &data));
            }
            _ => {}
        }
    }

    async fn reply_loop4(self: Arc<Self>, sock: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match sock.recv_from(&mut buf).await {
                Ok((n, src)) => {
                    // One bad reply drops one packet, never the loop.
                    if let Err(e) = self.deliver4(&buf[..n], src) {
                        trace!(error = %e, "icmpv4 reply dropped");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "icmpv4 reply socket error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn reply_loop6(self: Arc<Self>, sock: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match sock.recv_from(&mut buf).await {
                Ok((n, src)) => {
                    if let Err(e) = self.deliver6(&buf[..n], src) {
                        trace!(error = %e, "icmpv6 reply dropped");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "icmpv6 reply socket error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Inbound ICMPv4 from the host. Depending on the platform the datagram
    /// carries a full IP packet or a bare ICMP message; both are accepted.
    fn deliver4(&self, datagram: &[u8], src: SocketAddr) -> std::result::Result<(), String> {
        let (message, ttl) = strip_ipv4_header(datagram);
        if message.len() < 8 {
            return Err("short icmp message".into());
        }
        let src_ip = match src.ip() {
            IpAddr::V4(v4) => self
                .nat
                .inverse(IpAddr::V4(v4))
                .map(|ip| match ip {
                    IpAddr::V4(v) => v,
                    IpAddr::V6(_) => v4,
                })
                .unwrap_or(v4),
            IpAddr::V6(_) => return Err("v6 source on v4 socket".into()),
        };

        match message[0] {
            ICMP4_ECHO_REPLY => {
                let guest = self
                    .last_src4
                    .lock()
                    .expect("slot poisoned")
                    .ok_or("no echo source recorded")?;
                self.stack
                    .inject_frame(frames::icmpv4_raw(src_ip, guest, ttl, message));
                Ok(())
            }
            ICMP4_DST_UNREACHABLE | ICMP4_TIME_EXCEEDED => {
                let mut message = message.to_vec();
                let guest = self.rewrite_nested_v4(&mut message[8..])?;
                let guest = match guest {
                    Some(g) => g,
                    None => self
                        .last_src4
                        .lock()
                        .expect("slot poisoned")
                        .ok_or("no echo source recorded")?,
                };
                // Body changed; redo the ICMP checksum.
                message[2] = 0;
                message[3] = 0;
                let cksum = internet_checksum(&message);
                message[2..4].copy_from_slice(&cksum.to_be_bytes());
                self.stack
                    .inject_frame(frames::icmpv4_raw(src_ip, guest, ttl, &message));
                Ok(())
            }
            _ => Err("unhandled icmpv4 type".into()),
        }
    }

    fn deliver6(&self, message: &[u8], src: SocketAddr) -> std::result::Result<(), String> {
        if message.len() < 8 {
            return Err("short icmpv6 message".into());
        }
        let src_ip = match src.ip() {
            IpAddr::V6(v6) => self
                .nat
                .inverse(IpAddr::V6(v6))
                .map(|ip| match ip {
                    IpAddr::V6(v) => v,
                    IpAddr::V4(_) => v6,
                })
                .unwrap_or(v6),
            IpAddr::V4(_) => return Err("v4 source on v6 socket".into()),
        };

        match message[0] {
            ICMP6_ECHO_REPLY => {
                let guest = self
                    .last_src6
                    .lock()
                    .expect("slot poisoned")
                    .ok_or("no echo source recorded")?;
                // Hop limit and traffic class would come from control
                // messages; 64 is what the host stack uses in practice.
                self.stack
                    .inject_frame(frames::icmpv6_raw(src_ip, guest, 64, message));
                Ok(())
            }
            ICMP6_DST_UNREACHABLE | ICMP6_TIME_EXCEEDED => {
                let mut message = message.to_vec();
                let guest = self.rewrite_nested_v6(&mut message[8..])?;
                let guest = match guest {
                    Some(g) => g,
                    None => self
                        .last_src6
                        .lock()
                        .expect("slot poisoned")
                        .ok_or("no echo source recorded")?,
                };
                // The outer checksum is refilled during frame emission.
                self.stack
                    .inject_frame(frames::icmpv6_raw(src_ip, guest, 64, &message));
                Ok(())
            }
            _ => Err("unhandled icmpv6 type".into()),
        }
    }

    /// Restore the guest's virtual 5-tuple inside a nested IPv4 packet.
    /// Returns the guest address to deliver the error to, when known.
    fn rewrite_nested_v4(
        &self,
        nested: &mut [u8],
    ) -> std::result::Result<Option<Ipv4Addr>, String> {
        if nested.len() < 20 || nested[0] >> 4 != 4 {
            return Err("nested packet is not ipv4".into());
        }
        let ihl = ((nested[0] & 0x0f) * 4) as usize;
        if ihl < 20 || nested.len() < ihl + 8 {
            return Err("nested packet truncated".into());
        }
        if nested[9] != 17 {
            // Only UDP flows are tracked; other protocols pass unchanged.
            return Ok(None);
        }

        let src_port = u16::from_be_bytes([nested[ihl], nested[ihl + 1]]);
        let Some((guest, virtual_dst)) = self.reverse.lookup(false, src_port) else {
            return Ok(None);
        };
        let (IpAddr::V4(guest_ip), IpAddr::V4(vdst_ip)) = (guest.ip(), virtual_dst.ip()) else {
            return Ok(None);
        };

        let old_src: [u8; 4] = nested[12..16].try_into().unwrap();
        let old_dst: [u8; 4] = nested[16..20].try_into().unwrap();
        let old_sport = [nested[ihl], nested[ihl + 1]];
        let old_dport = [nested[ihl + 2], nested[ihl + 3]];

        nested[12..16].copy_from_slice(&guest_ip.octets());
        nested[16..20].copy_from_slice(&vdst_ip.octets());
        nested[ihl..ihl + 2].copy_from_slice(&guest.port().to_be_bytes());
        nested[ihl + 2..ihl + 4].copy_from_slice(&virtual_dst.port().to_be_bytes());

        // The nested UDP checksum covers the pseudo-header; adjust it
        // incrementally when present (the payload itself is usually
        // truncated away).
        let udp_cksum = u16::from_be_bytes([nested[ihl + 6], nested[ihl + 7]]);
        if udp_cksum != 0 {
            let mut cksum = udp_cksum;
            cksum = checksum_adjust(cksum, &old_src, &guest_ip.octets());
            cksum = checksum_adjust(cksum, &old_dst, &vdst_ip.octets());
            cksum = checksum_adjust(cksum, &old_sport, &guest.port().to_be_bytes());
            cksum = checksum_adjust(cksum, &old_dport, &virtual_dst.port().to_be_bytes());
            nested[ihl + 6..ihl + 8].copy_from_slice(&cksum.to_be_bytes());
        }

        // Nested IP header checksum is fully recomputable.
        nested[10] = 0;
        nested[11] = 0;
        let ip_cksum = internet_checksum(&nested[..ihl]);
        nested[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

        Ok(Some(guest_ip))
    }

    fn rewrite_nested_v6(
        &self,
        nested: &mut [u8],
    ) -> std::result::Result<Option<Ipv6Addr>, String> {
        if nested.len() < 40 || nested[0] >> 4 != 6 {
            return Err("nested packet is not ipv6".into());
        }
        if nested[6] != 17 || nested.len() < 48 {
            return Ok(None);
        }

        let src_port = u16::from_be_bytes([nested[40], nested[41]]);
        let Some((guest, virtual_dst)) = self.reverse.lookup(true, src_port) else {
            return Ok(None);
        };
        let (IpAddr::V6(guest_ip), IpAddr::V6(vdst_ip)) = (guest.ip(), virtual_dst.ip()) else {
            return Ok(None);
        };

        let old_src: [u8; 16] = nested[8..24].try_into().unwrap();
        let old_dst: [u8; 16] = nested[24..40].try_into().unwrap();
        let old_sport = [nested[40], nested[41]];
        let old_dport = [nested[42], nested[43]];

        nested[8..24].copy_from_slice(&guest_ip.octets());
        nested[24..40].copy_from_slice(&vdst_ip.octets());
        nested[40..42].copy_from_slice(&guest.port().to_be_bytes());
        nested[42..44].copy_from_slice(&virtual_dst.port().to_be_bytes());

        let udp_cksum = u16::from_be_bytes([nested[46], nested[47]]);
        if udp_cksum != 0 {
            let mut cksum = udp_cksum;
            cksum = checksum_adjust(cksum, &old_src, &guest_ip.octets());
            cksum = checksum_adjust(cksum, &old_dst, &vdst_ip.octets());
            cksum = checksum_adjust(cksum, &old_sport, &guest.port().to_be_bytes());
            cksum = checksum_adjust(cksum, &old_dport, &virtual_dst.port().to_be_bytes());
            nested[46..48].copy_from_slice(&cksum.to_be_bytes());
        }

        Ok(Some(guest_ip))
    }
}

/// Some platforms hand the full IP packet to SOCK_DGRAM ICMP receivers;
/// others strip it. Returns the ICMP message and the best-known TTL.
fn strip_ipv4_header(datagram: &[u8]) -> (&[u8], u8) {
    if datagram.len() >= 20 && datagram[0] >> 4 == 4 && datagram[9] == 1 {
        let ihl = ((datagram[0] & 0x0f) * 4) as usize;
        if ihl >= 20 && datagram.len() > ihl {
            return (&datagram[ihl..], datagram[8]);
        }
    }
    (datagram, 64)
}

/// RFC 1071 checksum over a whole buffer.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1624 incremental checksum update for a replaced byte range:
/// `HC' = ~(~HC + ~m + m')`.
fn checksum_adjust(cksum: u16, old: &[u8], new: &[u8]) -> u16 {
    debug_assert_eq!(old.len() % 2, 0);
    debug_assert_eq!(old.len(), new.len());
    let mut sum: u32 = (!cksum) as u32;
    for o in old.chunks_exact(2) {
        sum += (!u16::from_be_bytes([o[0], o[1]])) as u32;
    }
    for n in new.chunks_exact(2) {
        sum += u16::from_be_bytes([n[0], n[1]]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internet_checksum_verifies() {
        // A checksummed buffer re-sums to zero.
        let mut header = [0u8; 20];
        header[0] = 0x45;
        header[9] = 17;
        let cksum = internet_checksum(&header);
        header[10..12].copy_from_slice(&cksum.to_be_bytes());
        let mut sum: u32 = 0;
        for chunk in header.chunks_exact(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum, 0xffff);
    }

    #[test]
    fn incremental_adjust_matches_recompute() {
        let mut data = [0u8; 12];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8 * 7;
        }
        let original = internet_checksum(&data);

        let old: [u8; 4] = data[4..8].try_into().unwrap();
        let new = [0xde, 0xad, 0xbe, 0xef];
        data[4..8].copy_from_slice(&new);

        let adjusted = checksum_adjust(original, &old, &new);
        assert_eq!(adjusted, internet_checksum(&data));
    }

    #[test]
    fn ipv4_header_stripping() {
        let mut datagram = vec![0u8; 28];
        datagram[0] = 0x45;
        datagram[8] = 51; // ttl
        datagram[9] = 1; // icmp
        datagram[20] = ICMP4_ECHO_REPLY;
        let (message, ttl) = strip_ipv4_header(&datagram);
        assert_eq!(message.len(), 8);
        assert_eq!(ttl, 51);

        let bare = [0u8; 8];
        let (message, ttl) = strip_ipv4_header(&bare);
        assert_eq!(message.len(), 8);
        assert_eq!(ttl, 64);
    }
}
