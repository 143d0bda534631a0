//! Test guest: builds and parses frames on the guest side of the link.
//!
//! Just enough of a guest stack to exercise the gateway end to end:
//! frames are hand-assembled with smoltcp wire types, and the TCP "client"
//! tracks sequence numbers manually.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpAddress, IpProtocol, Ipv4Packet,
    Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket, UdpRepr,
};
use tokio::net::UnixDatagram;

use vnet_gateway::stack::{GATEWAY_MAC, GUEST4, GUEST_MAC};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestGuest {
    sock: UnixDatagram,
}

impl TestGuest {
    /// A connected pair: the guest side and the side handed to the
    /// gateway's link endpoint.
    pub fn pair() -> (TestGuest, UnixDatagram) {
        let (guest, gateway) = UnixDatagram::pair().expect("socket pair");
        (TestGuest { sock: guest }, gateway)
    }

    pub async fn send(&self, frame: &[u8]) {
        self.sock.send(frame).await.expect("guest send");
    }

    pub async fn recv(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 65536];
        let n = tokio::time::timeout(RECV_TIMEOUT, self.sock.recv(&mut buf))
            .await
            .expect("timed out waiting for gateway frame")
            .expect("guest recv");
        buf.truncate(n);
        buf
    }

    /// Receive frames until the predicate yields; unrelated traffic (ACKs,
    /// ND chatter) is skipped.
    pub async fn recv_matching<T>(&self, mut pred: impl FnMut(&Frame) -> Option<T>) -> T {
        loop {
            let raw = self.recv().await;
            let frame = parse(&raw);
            if let Some(value) = pred(&frame) {
                return value;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed gateway→guest frames
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Frame {
    Arp {
        claimed_ip: Ipv4Addr,
        claimed_mac: [u8; 6],
    },
    Tcp {
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        ack: u32,
        syn: bool,
        fin: bool,
        rst: bool,
        is_ack: bool,
        window: u16,
        payload: Vec<u8>,
    },
    Udp {
        src: SocketAddr,
        dst: SocketAddr,
        payload: Vec<u8>,
    },
    Icmp4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        msg_type: Icmpv4Message,
        body: Vec<u8>,
    },
    Other,
}

pub fn parse(raw: &[u8]) -> Frame {
    let Ok(eth) = EthernetFrame::new_checked(raw) else {
        return Frame::Other;
    };
    match eth.ethertype() {
        EthernetProtocol::Arp => {
            let Ok(packet) = ArpPacket::new_checked(eth.payload()) else {
                return Frame::Other;
            };
            let Ok(ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Reply,
                source_hardware_addr,
                source_protocol_addr,
                ..
            }) = ArpRepr::parse(&packet)
            else {
                return Frame::Other;
            };
            Frame::Arp {
                claimed_ip: Ipv4Addr::from(source_protocol_addr.0),
                claimed_mac: source_hardware_addr.0,
            }
        }
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
                return Frame::Other;
            };
            let src_ip = Ipv4Addr::from(ip.src_addr().0);
            let dst_ip = Ipv4Addr::from(ip.dst_addr().0);
            match ip.next_header() {
                IpProtocol::Tcp => {
                    let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
                        return Frame::Other;
                    };
                    Frame::Tcp {
                        src: SocketAddr::new(IpAddr::V4(src_ip), tcp.src_port()),
                        dst: SocketAddr::new(IpAddr::V4(dst_ip), tcp.dst_port()),
                        seq: tcp.seq_number().0 as u32,
                        ack: tcp.ack_number().0 as u32,
                        syn: tcp.syn(),
                        fin: tcp.fin(),
                        rst: tcp.rst(),
                        is_ack: tcp.ack(),
                        window: tcp.window_len(),
                        payload: tcp.payload().to_vec(),
                    }
                }
                IpProtocol::Udp => {
                    let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
                        return Frame::Other;
                    };
                    Frame::Udp {
                        src: SocketAddr::new(IpAddr::V4(src_ip), udp.src_port()),
                        dst: SocketAddr::new(IpAddr::V4(dst_ip), udp.dst_port()),
                        payload: udp.payload().to_vec(),
                    }
                }
                IpProtocol::Icmp => {
                    let Ok(icmp) = Icmpv4Packet::new_checked(ip.payload()) else {
                        return Frame::Other;
                    };
                    Frame::Icmp4 {
                        src: src_ip,
                        dst: dst_ip,
                        msg_type: icmp.msg_type(),
                        body: ip.payload().to_vec(),
                    }
                }
                _ => Frame::Other,
            }
        }
        _ => Frame::Other,
    }
}

// ---------------------------------------------------------------------------
// Guest→gateway frame builders
// ---------------------------------------------------------------------------

fn guest_eth(ethertype: EthernetProtocol) -> EthernetRepr {
    EthernetRepr {
        src_addr: EthernetAddress(GUEST_MAC),
        dst_addr: EthernetAddress(GATEWAY_MAC),
        ethertype,
    }
}

fn emit_guest_ipv4(ip_repr: Ipv4Repr, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let eth = guest_eth(EthernetProtocol::Ipv4);
    let mut buf = vec![0u8; eth.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    fill(ip.payload_mut());
    buf
}

pub fn guest_arp_request(target: Ipv4Addr) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(GUEST_MAC),
        source_protocol_addr: smoltcp::wire::Ipv4Address(GUEST4.octets()),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: smoltcp::wire::Ipv4Address(target.octets()),
    };
    let eth = guest_eth(EthernetProtocol::Arp);
    let mut buf = vec![0u8; eth.buffer_len() + repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    repr.emit(&mut arp);
    buf
}

pub fn guest_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: Option<u32>,
    control: TcpControl,
    payload: &[u8],
) -> Vec<u8> {
    let (SocketAddr::V4(src_v4), SocketAddr::V4(dst_v4)) = (src, dst) else {
        panic!("v4 only in the test guest");
    };
    let src_ip = smoltcp::wire::Ipv4Address(src_v4.ip().octets());
    let dst_ip = smoltcp::wire::Ipv4Address(dst_v4.ip().octets());
    let repr = TcpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
        seq_number: TcpSeqNumber(seq as i32),
        ack_number: ack.map(|a| TcpSeqNumber(a as i32)),
        window_len: 64240,
        window_scale: None,
        control,
        max_seg_size: if control == TcpControl::Syn {
            Some(1460)
        } else {
            None
        },
        sack_permitted: false,
        sack_ranges: [None; 3],
        payload,
    };
    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Tcp,
        payload_len: repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    emit_guest_ipv4(ip_repr, |ip_payload| {
        let mut tcp = TcpPacket::new_unchecked(ip_payload);
        repr.emit(
            &mut tcp,
            &IpAddress::Ipv4(src_ip),
            &IpAddress::Ipv4(dst_ip),
            &ChecksumCapabilities::default(),
        );
    })
}

pub fn guest_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let (SocketAddr::V4(src_v4), SocketAddr::V4(dst_v4)) = (src, dst) else {
        panic!("v4 only in the test guest");
    };
    let src_ip = smoltcp::wire::Ipv4Address(src_v4.ip().octets());
    let dst_ip = smoltcp::wire::Ipv4Address(dst_v4.ip().octets());
    let repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Udp,
        payload_len: repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    emit_guest_ipv4(ip_repr, |ip_payload| {
        let mut udp = UdpPacket::new_unchecked(ip_payload);
        repr.emit(
            &mut udp,
            &IpAddress::Ipv4(src_ip),
            &IpAddress::Ipv4(dst_ip),
            payload.len(),
            |buf| buf.copy_from_slice(payload),
            &ChecksumCapabilities::default(),
        );
    })
}

pub fn guest_icmp_echo(dst: Ipv4Addr, ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
    let icmp = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    };
    let ip_repr = Ipv4Repr {
        src_addr: smoltcp::wire::Ipv4Address(GUEST4.octets()),
        dst_addr: smoltcp::wire::Ipv4Address(dst.octets()),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    emit_guest_ipv4(ip_repr, |ip_payload| {
        let mut packet = Icmpv4Packet::new_unchecked(ip_payload);
        icmp.emit(&mut packet, &ChecksumCapabilities::default());
    })
}
