//! User-space TCP/IP plane.
//!
//! Network layout, fixed at build time:
//! - IPv4: gateway 172.30.30.1/24, guest .2, services .200,
//!   secure-services .201, host-NAT .254
//! - IPv6: gateway fc00:a0b5:e8cf::1/64, guest ::2, host-NAT ::254
//!
//! The guest is the only peer on the link. Every frame is accepted and any
//! source address may be impersonated when injecting packets (the plane is
//! effectively promiscuous and spoofing by construction). ARP and neighbor
//! solicitations are answered for every address the gateway fronts; IP
//! traffic is routed by protocol into the TCP engine, the UDP registry, or
//! the ICMP proxy. smoltcp supplies wire formats and checksums; forwarding
//! logic is manual.

pub mod frames;
pub mod vtcp;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, Icmpv4Message,
    Icmpv4Packet, Icmpv4Repr, Icmpv6Message, Icmpv6Packet, Icmpv6Repr, IpAddress, IpProtocol,
    Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, NdiscRepr, TcpPacket, UdpPacket,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::link::{Link, ETH_HEADER_LEN};
use crate::{Error, Result};
use vtcp::{ConnectRequest, FlowKey, SynPacketInfo, VtcpStream};

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

pub const GATEWAY4: Ipv4Addr = Ipv4Addr::new(172, 30, 30, 1);
pub const GUEST4: Ipv4Addr = Ipv4Addr::new(172, 30, 30, 2);
pub const SERVICES4: Ipv4Addr = Ipv4Addr::new(172, 30, 30, 200);
pub const SECURE_SERVICES4: Ipv4Addr = Ipv4Addr::new(172, 30, 30, 201);
pub const HOST_NAT4: Ipv4Addr = Ipv4Addr::new(172, 30, 30, 254);
pub const SUBNET4_PREFIX: u8 = 24;

pub const GATEWAY6: Ipv6Addr = Ipv6Addr::new(0xfc00, 0xa0b5, 0xe8cf, 0, 0, 0, 0, 0x1);
pub const GUEST6: Ipv6Addr = Ipv6Addr::new(0xfc00, 0xa0b5, 0xe8cf, 0, 0, 0, 0, 0x2);
pub const HOST_NAT6: Ipv6Addr = Ipv6Addr::new(0xfc00, 0xa0b5, 0xe8cf, 0, 0, 0, 0, 0x254);
pub const SUBNET6_PREFIX: u8 = 64;

/// Shared prefix; the final octet varies per network role.
pub const GATEWAY_MAC: [u8; 6] = [0x9e, 0xd6, 0x60, 0xf3, 0xa0, 0x01];
pub const GUEST_MAC: [u8; 6] = [0x9e, 0xd6, 0x60, 0xf3, 0xa0, 0x02];

/// Maximum SYNs parked awaiting a forwarder decision.
const LISTEN_BACKLOG: usize = 4096;

pub fn subnet4() -> ipnet::Ipv4Net {
    ipnet::Ipv4Net::new(GATEWAY4, SUBNET4_PREFIX).expect("static subnet")
}

pub fn subnet6() -> ipnet::Ipv6Net {
    ipnet::Ipv6Net::new(GATEWAY6, SUBNET6_PREFIX).expect("static subnet")
}

/// Addresses the stack itself fronts (answers ARP/ND, echo, services).
pub fn stack_owned_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4 == GATEWAY4 || v4 == SERVICES4 || v4 == SECURE_SERVICES4 || v4 == HOST_NAT4
        }
        IpAddr::V6(v6) => v6 == GATEWAY6 || v6 == HOST_NAT6,
    }
}

/// Destinations the TCP forwarder refuses outright.
pub fn undialable_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_multicast() || v4.is_broadcast() || v4.is_link_local() || v4 == GUEST4
        }
        IpAddr::V6(v6) => {
            v6.is_multicast() || (v6.segments()[0] & 0xffc0) == 0xfe80 || v6 == GUEST6
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring traits
// ---------------------------------------------------------------------------

/// Metadata for a guest UDP datagram.
#[derive(Debug, Clone, Copy)]
pub struct UdpMeta {
    /// Guest-side source.
    pub guest: SocketAddr,
    /// Destination the guest was sending to.
    pub local: SocketAddr,
    /// TTL / hop limit from the guest's IP header.
    pub ttl: u8,
}

/// Metadata for an outbound echo request.
#[derive(Debug, Clone, Copy)]
pub struct EchoMeta {
    pub guest_src: IpAddr,
    pub dst: IpAddr,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Decides the fate of guest SYNs not claimed by an in-stack service.
pub trait TcpAcceptor: Send + Sync {
    fn incoming(&self, req: ConnectRequest);
}

/// An in-stack TCP listener (DNS-over-TCP, host-control, ssh-agent).
pub trait TcpService: Send + Sync {
    fn serve(&self, stream: VtcpStream);
}

/// An in-stack UDP endpoint: static services and dynamic binds both.
pub trait UdpService: Send + Sync {
    fn datagram(&self, meta: UdpMeta, payload: Vec<u8>);
}

/// Receives echo requests bound for off-stack destinations.
pub trait IcmpProxy: Send + Sync {
    /// `message` is the full ICMP message, header included.
    fn echo_request_v4(&self, meta: EchoMeta, message: Vec<u8>);
    fn echo_request_v6(&self, meta: EchoMeta, message: Vec<u8>);
}

/// Component graph handed to the stack at construction. The stack is the
/// sole owner of its flows; the leaves here never observe it.
pub struct StackWiring {
    pub tcp_acceptor: Arc<dyn TcpAcceptor>,
    pub udp_fallback: Arc<dyn UdpService>,
    pub icmp: Arc<dyn IcmpProxy>,
    pub tcp_services: HashMap<(IpAddr, u16), Arc<dyn TcpService>>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

type UdpRegistry = RwLock<HashMap<(IpAddr, u16), Arc<dyn UdpService>>>;

/// Cheap clone giving any component packet injection and guest dialing
/// without owning the stack.
#[derive(Clone)]
pub struct StackHandle {
    egress: mpsc::UnboundedSender<Vec<u8>>,
    vtcp_cmd: mpsc::UnboundedSender<vtcp::Command>,
    udp_binds: Arc<UdpRegistry>,
    mtu: usize,
}

/// Receiving halves produced alongside a [`StackHandle`].
pub struct StackChannels {
    egress_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cmd_rx: mpsc::UnboundedReceiver<vtcp::Command>,
}

impl StackHandle {
    pub fn new(mtu: usize) -> (Self, StackChannels) {
        let (egress, egress_rx) = mpsc::unbounded_channel();
        let (vtcp_cmd, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                egress,
                vtcp_cmd,
                udp_binds: Arc::new(RwLock::new(HashMap::new())),
                mtu,
            },
            StackChannels { egress_rx, cmd_rx },
        )
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Queue a fully-built frame toward the guest.
    pub fn inject_frame(&self, frame: Vec<u8>) {
        let _ = self.egress.send(frame);
    }

    /// Send a UDP datagram to the guest from an arbitrary local address.
    /// Oversized payloads are dropped; the plane does not fragment.
    pub fn send_udp(&self, local: SocketAddr, guest: SocketAddr, payload: &[u8]) {
        let headers = match guest {
            SocketAddr::V4(_) => 20 + 8,
            SocketAddr::V6(_) => 40 + 8,
        };
        if payload.len() + headers > self.mtu {
            warn!(
                len = payload.len(),
                mtu = self.mtu,
                "udp payload exceeds mtu, dropped"
            );
            return;
        }
        self.inject_frame(frames::udp_datagram(local, guest, payload));
    }

    /// Open a TCP connection toward the guest, impersonating `local`.
    pub async fn connect_guest(&self, local: SocketAddr, guest: SocketAddr) -> Result<VtcpStream> {
        let (reply, rx) = oneshot::channel();
        self.vtcp_cmd
            .send(vtcp::Command::Connect {
                key: FlowKey { local, guest },
                reply,
            })
            .map_err(|_| Error::Stack("stack is gone".into()))?;
        rx.await.map_err(|_| Error::Stack("stack is gone".into()))?
    }

    /// Register a dynamic in-stack UDP endpoint. Fails if the address is
    /// already bound.
    pub fn bind_udp(&self, addr: SocketAddr, service: Arc<dyn UdpService>) -> Result<()> {
        let mut binds = self.udp_binds.write().expect("udp registry poisoned");
        let key = (addr.ip(), addr.port());
        if binds.contains_key(&key) {
            return Err(Error::Stack(format!("udp {} already bound", addr)));
        }
        binds.insert(key, service);
        Ok(())
    }

    pub fn unbind_udp(&self, addr: SocketAddr) {
        let mut binds = self.udp_binds.write().expect("udp registry poisoned");
        binds.remove(&(addr.ip(), addr.port()));
    }
}

// ---------------------------------------------------------------------------
// The stack task
// ---------------------------------------------------------------------------

pub struct Netstack {
    link: Arc<dyn Link>,
    engine: vtcp::Engine,
    handle: StackHandle,
    channels: Option<StackChannels>,
    wiring: StackWiring,
    shutdown: watch::Receiver<bool>,
}

impl Netstack {
    pub fn new(
        link: Arc<dyn Link>,
        handle: StackHandle,
        channels: StackChannels,
        wiring: StackWiring,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let engine = vtcp::Engine::new(
            handle.egress.clone(),
            handle.vtcp_cmd.clone(),
            handle.mtu,
        );
        Self {
            link,
            engine,
            handle,
            channels: Some(channels),
            wiring,
            shutdown,
        }
    }

    /// Run until the link dies or shutdown is signalled. Owns the single
    /// reader; writes drain through a separate task so dispatch never waits
    /// on the link.
    pub async fn run(mut self) {
        let StackChannels {
            mut egress_rx,
            mut cmd_rx,
        } = self.channels.take().expect("run called twice");

        let writer_link = self.link.clone();
        let mut writer_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = egress_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = writer_link.send(&frame).await {
                                debug!(error = %e, "link write failed");
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.changed() => break,
                }
            }
        });

        let link = self.link.clone();
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; self.handle.mtu + ETH_HEADER_LEN];
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                recv = link.recv(&mut buf) => match recv {
                    Ok(n) => {
                        let frame = buf[..n].to_vec();
                        self.dispatch(&frame);
                    }
                    Err(e) => {
                        warn!(error = %e, "link read failed, stack stopping");
                        break;
                    }
                },
                Some(cmd) = cmd_rx.recv() => self.engine.handle_command(cmd),
                _ = tick.tick() => self.engine.tick(),
                _ = shutdown.changed() => {
                    debug!("stack shutdown requested");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: &[u8]) {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return;
        };
        match eth.ethertype() {
            EthernetProtocol::Arp => self.handle_arp(eth.payload()),
            EthernetProtocol::Ipv4 => self.handle_ipv4(eth.payload()),
            EthernetProtocol::Ipv6 => self.handle_ipv6(eth.payload()),
            other => trace!(?other, "ignoring ethertype"),
        }
    }

    /// Answer as the gateway for every address on the subnet except the
    /// guest's own.
    fn handle_arp(&mut self, payload: &[u8]) {
        let Ok(packet) = ArpPacket::new_checked(payload) else {
            return;
        };
        let Ok(ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        }) = ArpRepr::parse(&packet)
        else {
            return;
        };

        let target = frames::ip4_std(target_protocol_addr);
        if target == GUEST4 {
            return;
        }
        trace!(%target, "arp request answered");
        self.handle.inject_frame(frames::arp_reply(
            target,
            source_hardware_addr.0,
            frames::ip4_std(source_protocol_addr),
        ));
    }

    fn handle_ipv4(&mut self, payload: &[u8]) {
        let Ok(ip) = Ipv4Packet::new_checked(payload) else {
            return;
        };
        // Link capabilities say frames arrive checksum-valid; skip verify.
        let src = frames::ip4_std(ip.src_addr());
        let dst = frames::ip4_std(ip.dst_addr());
        let ttl = ip.hop_limit();
        let tos = payload[1];

        match ip.next_header() {
            IpProtocol::Tcp => {
                let Ok(header) = Ipv4Repr::parse(&ip, &ChecksumCapabilities::ignored()) else {
                    return;
                };
                let mut data = [0u8; 8];
                let l4 = ip.payload();
                if l4.len() >= 8 {
                    data.copy_from_slice(&l4[..8]);
                }
                self.handle_tcp(
                    IpAddr::V4(src),
                    IpAddr::V4(dst),
                    ip.payload(),
                    SynPacketInfo::V4 { header, data },
                );
            }
            IpProtocol::Udp => self.handle_udp(IpAddr::V4(src), IpAddr::V4(dst), ttl, ip.payload()),
            IpProtocol::Icmp => self.handle_icmpv4(src, dst, ttl, tos, ip.payload()),
            other => trace!(?other, "ipv4 protocol dropped"),
        }
    }

    fn handle_ipv6(&mut self, payload: &[u8]) {
        let Ok(ip) = Ipv6Packet::new_checked(payload) else {
            return;
        };
        let src = frames::ip6_std(ip.src_addr());
        let dst = frames::ip6_std(ip.dst_addr());
        let hop_limit = ip.hop_limit();
        let traffic_class = (payload[0] << 4) | (payload[1] >> 4);

        match ip.next_header() {
            IpProtocol::Tcp => {
                let Ok(header) = Ipv6Repr::parse(&ip) else {
                    return;
                };
                let mut data = [0u8; 8];
                let l4 = ip.payload();
                if l4.len() >= 8 {
                    data.copy_from_slice(&l4[..8]);
                }
                self.handle_tcp(
                    IpAddr::V6(src),
                    IpAddr::V6(dst),
                    ip.payload(),
                    SynPacketInfo::V6 { header, data },
                );
            }
            IpProtocol::Udp => self.handle_udp(
                IpAddr::V6(src),
                IpAddr::V6(dst),
                hop_limit,
                ip.payload(),
            ),
            IpProtocol::Icmpv6 => {
                self.handle_icmpv6(src, dst, hop_limit, traffic_class, ip.payload())
            }
            other => trace!(?other, "ipv6 protocol dropped"),
        }
    }

    fn handle_tcp(&mut self, src: IpAddr, dst: IpAddr, l4: &[u8], syn_info: SynPacketInfo) {
        let Ok(tcp) = TcpPacket::new_checked(l4) else {
            return;
        };
        if undialable_ip(dst) {
            trace!(%dst, "tcp to undialable destination dropped");
            return;
        }

        let key = FlowKey {
            local: SocketAddr::new(dst, tcp.dst_port()),
            guest: SocketAddr::new(src, tcp.src_port()),
        };

        // Fresh SYNs beyond the backlog are dropped; the guest retries.
        if tcp.syn() && !tcp.ack() && self.engine.parked() >= LISTEN_BACKLOG {
            debug!("listen backlog full, syn dropped");
            return;
        }

        let service = self
            .wiring
            .tcp_services
            .get(&(dst, tcp.dst_port()))
            .cloned();
        let acceptor = self.wiring.tcp_acceptor.clone();
        self.engine
            .handle_segment(key, &tcp, syn_info, &mut |req: ConnectRequest| {
                if let Some(service) = service.clone() {
                    tokio::spawn(async move {
                        match req.accept().await {
                            Ok(stream) => service.serve(stream),
                            Err(e) => debug!(error = %e, "in-stack accept failed"),
                        }
                    });
                } else {
                    acceptor.incoming(req);
                }
            });
    }

    fn handle_udp(&mut self, src: IpAddr, dst: IpAddr, ttl: u8, l4: &[u8]) {
        let Ok(udp) = UdpPacket::new_checked(l4) else {
            return;
        };
        let meta = UdpMeta {
            guest: SocketAddr::new(src, udp.src_port()),
            local: SocketAddr::new(dst, udp.dst_port()),
            ttl,
        };
        let bound = {
            let binds = self.handle.udp_binds.read().expect("udp registry poisoned");
            binds.get(&(dst, udp.dst_port())).cloned()
        };
        match bound {
            Some(service) => service.datagram(meta, udp.payload().to_vec()),
            None => self.wiring.udp_fallback.datagram(meta, udp.payload().to_vec()),
        }
    }

    fn handle_icmpv4(&mut self, src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, tos: u8, l4: &[u8]) {
        let Ok(icmp) = Icmpv4Packet::new_checked(l4) else {
            return;
        };
        if icmp.msg_type() != Icmpv4Message::EchoRequest {
            trace!("non-echo icmpv4 from guest dropped");
            return;
        }
        if stack_owned_ip(IpAddr::V4(dst)) {
            if let Ok(Icmpv4Repr::EchoRequest {
                ident,
                seq_no,
                data,
            }) = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::ignored())
            {
                self.handle
                    .inject_frame(frames::icmpv4_echo_reply(dst, src, ident, seq_no, data));
            }
            return;
        }
        self.wiring.icmp.echo_request_v4(
            EchoMeta {
                guest_src: IpAddr::V4(src),
                dst: IpAddr::V4(dst),
                hop_limit: ttl,
                traffic_class: tos,
            },
            l4.to_vec(),
        );
    }

    fn handle_icmpv6(
        &mut self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        traffic_class: u8,
        l4: &[u8],
    ) {
        let Ok(icmp) = Icmpv6Packet::new_checked(l4) else {
            return;
        };
        match icmp.msg_type() {
            Icmpv6Message::NeighborSolicit => {
                let src_w = IpAddress::Ipv6(frames::ip6(src));
                let dst_w = IpAddress::Ipv6(frames::ip6(dst));
                let Ok(Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit { target_addr, .. })) =
                    Icmpv6Repr::parse(&src_w, &dst_w, &icmp, &ChecksumCapabilities::ignored())
                else {
                    return;
                };
                let target = frames::ip6_std(target_addr);
                if target == GATEWAY6 || target == HOST_NAT6 {
                    self.handle
                        .inject_frame(frames::ndisc_neighbor_advert(target, src));
                }
            }
            Icmpv6Message::EchoRequest => {
                if stack_owned_ip(IpAddr::V6(dst)) {
                    let src_w = IpAddress::Ipv6(frames::ip6(src));
                    let dst_w = IpAddress::Ipv6(frames::ip6(dst));
                    if let Ok(Icmpv6Repr::EchoRequest {
                        ident,
                        seq_no,
                        data,
                    }) = Icmpv6Repr::parse(&src_w, &dst_w, &icmp, &ChecksumCapabilities::ignored())
                    {
                        self.handle.inject_frame(frames::icmpv6_echo_reply(
                            dst, src, ident, seq_no, data,
                        ));
                    }
                    return;
                }
                self.wiring.icmp.echo_request_v6(
                    EchoMeta {
                        guest_src: IpAddr::V6(src),
                        dst: IpAddr::V6(dst),
                        hop_limit,
                        traffic_class,
                    },
                    l4.to_vec(),
                );
            }
            _ => trace!("icmpv6 message dropped"),
        }
    }
}
