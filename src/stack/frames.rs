//! Ethernet frame construction.
//!
//! smoltcp wire representations do the header layout and checksum work;
//! everything here produces a complete frame addressed gateway → guest.
//! The guest is the only peer on the link, so destination MAC is always the
//! guest's and source is always the gateway's.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, Icmpv6DstUnreachable,
    Icmpv6Packet, Icmpv6Repr, IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr,
    NdiscNeighborFlags, NdiscRepr, RawHardwareAddress, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber, UdpPacket, UdpRepr,
};

use super::{GATEWAY_MAC, GUEST_MAC};

pub fn ip4(addr: Ipv4Addr) -> smoltcp::wire::Ipv4Address {
    smoltcp::wire::Ipv4Address(addr.octets())
}

pub fn ip4_std(addr: smoltcp::wire::Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

pub fn ip6(addr: Ipv6Addr) -> smoltcp::wire::Ipv6Address {
    smoltcp::wire::Ipv6Address(addr.octets())
}

pub fn ip6_std(addr: smoltcp::wire::Ipv6Address) -> Ipv6Addr {
    Ipv6Addr::from(addr.0)
}

fn eth_repr(ethertype: EthernetProtocol) -> EthernetRepr {
    EthernetRepr {
        src_addr: EthernetAddress(GATEWAY_MAC),
        dst_addr: EthernetAddress(GUEST_MAC),
        ethertype,
    }
}

/// Parameters for one TCP segment toward the guest.
pub struct TcpSegment {
    pub local: SocketAddr,
    pub guest: SocketAddr,
    pub seq: u32,
    /// `None` only for the initial SYN of an active open.
    pub ack: Option<u32>,
    pub window: u16,
    pub control: TcpControl,
    /// Advertise an MSS (SYN/SYN-ACK only).
    pub mss: Option<u16>,
}

pub fn tcp_segment(seg: &TcpSegment, payload: &[u8]) -> Vec<u8> {
    let repr = TcpRepr {
        src_port: seg.local.port(),
        dst_port: seg.guest.port(),
        seq_number: TcpSeqNumber(seg.seq as i32),
        ack_number: seg.ack.map(|a| TcpSeqNumber(a as i32)),
        window_len: seg.window,
        window_scale: None,
        control: seg.control,
        max_seg_size: seg.mss,
        sack_permitted: false,
        sack_ranges: [None; 3],
        payload,
    };

    match (seg.local, seg.guest) {
        (SocketAddr::V4(local), SocketAddr::V4(guest)) => {
            let src = ip4(*local.ip());
            let dst = ip4(*guest.ip());
            let ip_repr = Ipv4Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Tcp,
                payload_len: repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            emit_ipv4(ip_repr, |ip_payload| {
                let mut tcp = TcpPacket::new_unchecked(ip_payload);
                repr.emit(
                    &mut tcp,
                    &IpAddress::Ipv4(src),
                    &IpAddress::Ipv4(dst),
                    &ChecksumCapabilities::default(),
                );
            })
        }
        (SocketAddr::V6(local), SocketAddr::V6(guest)) => {
            let src = ip6(*local.ip());
            let dst = ip6(*guest.ip());
            let ip_repr = Ipv6Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Tcp,
                payload_len: repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            emit_ipv6(ip_repr, |ip_payload| {
                let mut tcp = TcpPacket::new_unchecked(ip_payload);
                repr.emit(
                    &mut tcp,
                    &IpAddress::Ipv6(src),
                    &IpAddress::Ipv6(dst),
                    &ChecksumCapabilities::default(),
                );
            })
        }
        _ => unreachable!("mixed address families in one flow"),
    }
}

pub fn udp_datagram(local: SocketAddr, guest: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let repr = UdpRepr {
        src_port: local.port(),
        dst_port: guest.port(),
    };

    match (local, guest) {
        (SocketAddr::V4(local), SocketAddr::V4(guest)) => {
            let src = ip4(*local.ip());
            let dst = ip4(*guest.ip());
            let ip_repr = Ipv4Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Udp,
                payload_len: repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            emit_ipv4(ip_repr, |ip_payload| {
                let mut udp = UdpPacket::new_unchecked(ip_payload);
                repr.emit(
                    &mut udp,
                    &IpAddress::Ipv4(src),
                    &IpAddress::Ipv4(dst),
                    payload.len(),
                    |buf| buf.copy_from_slice(payload),
                    &ChecksumCapabilities::default(),
                );
            })
        }
        (SocketAddr::V6(local), SocketAddr::V6(guest)) => {
            let src = ip6(*local.ip());
            let dst = ip6(*guest.ip());
            let ip_repr = Ipv6Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Udp,
                payload_len: repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            emit_ipv6(ip_repr, |ip_payload| {
                let mut udp = UdpPacket::new_unchecked(ip_payload);
                repr.emit(
                    &mut udp,
                    &IpAddress::Ipv6(src),
                    &IpAddress::Ipv6(dst),
                    payload.len(),
                    |buf| buf.copy_from_slice(payload),
                    &ChecksumCapabilities::default(),
                );
            })
        }
        _ => unreachable!("mixed address families in one flow"),
    }
}

/// Wrap an already-built ICMPv4 message (header included) in IP + Ethernet.
pub fn icmpv4_raw(src: Ipv4Addr, dst: Ipv4Addr, hop_limit: u8, message: &[u8]) -> Vec<u8> {
    let ip_repr = Ipv4Repr {
        src_addr: ip4(src),
        dst_addr: ip4(dst),
        next_header: IpProtocol::Icmp,
        payload_len: message.len(),
        hop_limit,
    };
    emit_ipv4(ip_repr, |ip_payload| {
        ip_payload.copy_from_slice(message);
    })
}

/// Wrap an ICMPv6 message in IP + Ethernet, recomputing its checksum for
/// the new pseudo-header.
pub fn icmpv6_raw(src: Ipv6Addr, dst: Ipv6Addr, hop_limit: u8, message: &[u8]) -> Vec<u8> {
    let ip_repr = Ipv6Repr {
        src_addr: ip6(src),
        dst_addr: ip6(dst),
        next_header: IpProtocol::Icmpv6,
        payload_len: message.len(),
        hop_limit,
    };
    emit_ipv6(ip_repr, |ip_payload| {
        ip_payload.copy_from_slice(message);
        let mut icmp = Icmpv6Packet::new_unchecked(ip_payload);
        icmp.set_checksum(0);
        icmp.fill_checksum(&IpAddress::Ipv6(ip6(src)), &IpAddress::Ipv6(ip6(dst)));
    })
}

/// ICMPv4 Destination Unreachable carrying the invoking header + 8 bytes.
pub fn icmpv4_unreachable(
    reason: Icmpv4DstUnreachable,
    original_ip: &Ipv4Repr,
    original_data: &[u8],
) -> Vec<u8> {
    let icmp = Icmpv4Repr::DstUnreachable {
        reason,
        header: *original_ip,
        data: original_data,
    };
    let ip_repr = Ipv4Repr {
        src_addr: ip4(super::GATEWAY4),
        dst_addr: original_ip.src_addr,
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    emit_ipv4(ip_repr, |ip_payload| {
        let mut packet = Icmpv4Packet::new_unchecked(ip_payload);
        icmp.emit(&mut packet, &ChecksumCapabilities::default());
    })
}

/// ICMPv6 Destination Unreachable carrying the invoking header + 8 bytes.
pub fn icmpv6_unreachable(
    reason: Icmpv6DstUnreachable,
    original_ip: &Ipv6Repr,
    original_data: &[u8],
) -> Vec<u8> {
    let icmp = Icmpv6Repr::DstUnreachable {
        reason,
        header: *original_ip,
        data: original_data,
    };
    let src = ip6(super::GATEWAY6);
    let dst = original_ip.src_addr;
    let ip_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    emit_ipv6(ip_repr, |ip_payload| {
        let mut packet = Icmpv6Packet::new_unchecked(ip_payload);
        icmp.emit(
            &IpAddress::Ipv6(src),
            &IpAddress::Ipv6(dst),
            &mut packet,
            &ChecksumCapabilities::default(),
        );
    })
}

/// Echo reply mirroring a request addressed to one of the stack's own IPs.
pub fn icmpv4_echo_reply(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
    let icmp = Icmpv4Repr::EchoReply {
        ident,
        seq_no,
        data,
    };
    let ip_repr = Ipv4Repr {
        src_addr: ip4(src),
        dst_addr: ip4(dst),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    emit_ipv4(ip_repr, |ip_payload| {
        let mut packet = Icmpv4Packet::new_unchecked(ip_payload);
        icmp.emit(&mut packet, &ChecksumCapabilities::default());
    })
}

pub fn icmpv6_echo_reply(src: Ipv6Addr, dst: Ipv6Addr, ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
    let icmp = Icmpv6Repr::EchoReply {
        ident,
        seq_no,
        data,
    };
    let src_w = ip6(src);
    let dst_w = ip6(dst);
    let ip_repr = Ipv6Repr {
        src_addr: src_w,
        dst_addr: dst_w,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    emit_ipv6(ip_repr, |ip_payload| {
        let mut packet = Icmpv6Packet::new_unchecked(ip_payload);
        icmp.emit(
            &IpAddress::Ipv6(src_w),
            &IpAddress::Ipv6(dst_w),
            &mut packet,
            &ChecksumCapabilities::default(),
        );
    })
}

/// ARP reply claiming `claimed_ip` for the gateway MAC.
pub fn arp_reply(claimed_ip: Ipv4Addr, requester_mac: [u8; 6], requester_ip: Ipv4Addr) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress(GATEWAY_MAC),
        source_protocol_addr: ip4(claimed_ip),
        target_hardware_addr: EthernetAddress(requester_mac),
        target_protocol_addr: ip4(requester_ip),
    };

    let eth = EthernetRepr {
        src_addr: EthernetAddress(GATEWAY_MAC),
        dst_addr: EthernetAddress(requester_mac),
        ethertype: EthernetProtocol::Arp,
    };

    let mut buf = vec![0u8; eth.buffer_len() + repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    repr.emit(&mut arp);
    buf
}

/// Neighbor Advertisement answering a solicitation for one of our v6 IPs.
pub fn ndisc_neighbor_advert(target: Ipv6Addr, guest_src: Ipv6Addr) -> Vec<u8> {
    let advert = NdiscRepr::NeighborAdvert {
        flags: NdiscNeighborFlags::SOLICITED,
        target_addr: ip6(target),
        lladdr: Some(RawHardwareAddress::from_bytes(&GATEWAY_MAC)),
    };
    let icmp = Icmpv6Repr::Ndisc(advert);
    let src = ip6(target);
    let dst = ip6(guest_src);
    let ip_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp.buffer_len(),
        hop_limit: 255,
    };
    emit_ipv6(ip_repr, |ip_payload| {
        let mut packet = Icmpv6Packet::new_unchecked(ip_payload);
        icmp.emit(
            &IpAddress::Ipv6(src),
            &IpAddress::Ipv6(dst),
            &mut packet,
            &ChecksumCapabilities::default(),
        );
    })
}

fn emit_ipv4(ip_repr: Ipv4Repr, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let eth = eth_repr(EthernetProtocol::Ipv4);
    let mut buf = vec![0u8; eth.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    fill(ip.payload_mut());
    // Payload emission happens after the header checksum; the IPv4 header
    // checksum does not cover the payload, so no refill is needed.
    buf
}

fn emit_ipv6(ip_repr: Ipv6Repr, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let eth = eth_repr(EthernetProtocol::Ipv6);
    let mut buf = vec![0u8; eth.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut ip = Ipv6Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip);
    fill(ip.payload_mut());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{EthernetFrame, Ipv4Packet, TcpPacket, UdpPacket};
    use std::net::SocketAddr;

    #[test]
    fn tcp_segment_layout() {
        let seg = TcpSegment {
            local: "93.184.216.34:80".parse().unwrap(),
            guest: SocketAddr::new(super::super::GUEST4.into(), 43210),
            seq: 1000,
            ack: Some(2000),
            window: 65535,
            control: TcpControl::Syn,
            mss: Some(1460),
        };
        let frame = tcp_segment(&seg, &[]);

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.src_addr(), EthernetAddress(GATEWAY_MAC));
        assert_eq!(eth.dst_addr(), EthernetAddress(GUEST_MAC));

        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip4_std(ip.src_addr()), "93.184.216.34".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip4_std(ip.dst_addr()), super::super::GUEST4);

        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.syn());
        assert!(tcp.ack());
        assert_eq!(tcp.src_port(), 80);
        assert_eq!(tcp.dst_port(), 43210);
        assert_eq!(tcp.seq_number().0 as u32, 1000);
    }

    #[test]
    fn udp_datagram_checksummed() {
        let frame = udp_datagram(
            SocketAddr::new(super::super::SERVICES4.into(), 53),
            SocketAddr::new(super::super::GUEST4.into(), 40000),
            b"reply",
        );
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 40000);
        assert_ne!(udp.checksum(), 0);
        assert_eq!(udp.payload(), b"reply");
    }

    #[test]
    fn arp_reply_claims_requested_ip() {
        let guest_mac = GUEST_MAC;
        let frame = arp_reply(
            super::super::GATEWAY4,
            guest_mac,
            super::super::GUEST4,
        );
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let arp = ArpPacket::new_checked(eth.payload()).unwrap();
        assert_eq!(arp.operation(), ArpOperation::Reply);
        assert_eq!(arp.source_hardware_addr(), &GATEWAY_MAC[..]);
    }

    #[test]
    fn unreachable_embeds_original_header() {
        let original = Ipv4Repr {
            src_addr: ip4(super::super::GUEST4),
            dst_addr: ip4("8.8.8.8".parse().unwrap()),
            next_header: IpProtocol::Udp,
            payload_len: 8,
            hop_limit: 64,
        };
        let frame = icmpv4_unreachable(
            Icmpv4DstUnreachable::HostUnreachable,
            &original,
            &[0u8; 8],
        );
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip4_std(ip.dst_addr()), super::super::GUEST4);
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), smoltcp::wire::Icmpv4Message::DstUnreachable);
    }
}
