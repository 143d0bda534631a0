//! End-to-end scenarios through a running gateway: a simulated guest on
//! one end of the socket pair, real host sockets on the other.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use smoltcp::wire::{Icmpv4Message, TcpControl};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{
    guest_arp_request, guest_icmp_echo, guest_tcp, guest_udp, Frame, TestGuest,
};
use vnet_gateway::stack::{GATEWAY4, GATEWAY_MAC, GUEST4, HOST_NAT4, SERVICES4};
use vnet_gateway::{Gateway, GatewayConfig, GatewayHandle};

async fn start_gateway(forwards: Vec<gateway_protocol::forward::ForwardSpec>) -> (TestGuest, GatewayHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (guest, gateway_side) = TestGuest::pair();
    let config = GatewayConfig {
        config_dir: dir.path().to_path_buf(),
        forwards,
        ..GatewayConfig::default()
    };
    let handle = Gateway::builder(config)
        .datagram_link(gateway_side)
        .build()
        .expect("gateway build")
        .start()
        .await
        .expect("gateway start");
    (guest, handle, dir)
}

#[tokio::test]
async fn arp_resolves_every_gateway_address() {
    let (guest, handle, _dir) = start_gateway(vec![]).await;

    for target in [GATEWAY4, SERVICES4, HOST_NAT4] {
        guest.send(&guest_arp_request(target)).await;
        let (ip, mac) = guest
            .recv_matching(|frame| match frame {
                Frame::Arp {
                    claimed_ip,
                    claimed_mac,
                } => Some((*claimed_ip, *claimed_mac)),
                _ => None,
            })
            .await;
        assert_eq!(ip, target);
        assert_eq!(mac, GATEWAY_MAC);
    }

    handle.shutdown();
}

#[tokio::test]
async fn gateway_answers_echo_with_matching_id_and_seq() {
    let (guest, handle, _dir) = start_gateway(vec![]).await;

    guest
        .send(&guest_icmp_echo(GATEWAY4, 0xbeef, 7, b"payload"))
        .await;
    let body = guest
        .recv_matching(|frame| match frame {
            Frame::Icmp4 {
                src,
                dst,
                msg_type: Icmpv4Message::EchoReply,
                body,
            } if *src == GATEWAY4 && *dst == GUEST4 => Some(body.clone()),
            _ => None,
        })
        .await;
    // Identifier and sequence ride at offsets 4..8 of the ICMP message.
    assert_eq!(&body[4..6], &0xbeefu16.to_be_bytes());
    assert_eq!(&body[6..8], &7u16.to_be_bytes());

    handle.shutdown();
}

/// Scenario: guest opens TCP to the host-NAT alias; a listener lives on
/// the host loopback. "PING" goes out, "PONG" comes back unchanged.
#[tokio::test]
async fn tcp_connect_through_host_nat() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener");
    let port = listener.local_addr().unwrap().port();

    let (guest, handle, _dir) = start_gateway(vec![]).await;

    let guest_addr = SocketAddr::new(IpAddr::V4(GUEST4), 43210);
    let remote = SocketAddr::new(IpAddr::V4(HOST_NAT4), port);
    let mut seq: u32 = 1000;

    // SYN; the gateway dials before answering.
    guest
        .send(&guest_tcp(guest_addr, remote, seq, None, TcpControl::Syn, &[]))
        .await;
    let accept = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.expect("read ping");
        assert_eq!(&buf, b"PING");
        conn.write_all(b"PONG").await.expect("write pong");
        conn
    });

    let (synack_seq, synack_ack) = guest
        .recv_matching(|frame| match frame {
            Frame::Tcp {
                src, syn: true, is_ack: true, seq, ack, ..
            } if *src == remote => Some((*seq, *ack)),
            _ => None,
        })
        .await;
    seq = seq.wrapping_add(1);
    assert_eq!(synack_ack, seq);

    // Handshake ACK, then data.
    let mut ack = synack_seq.wrapping_add(1);
    guest
        .send(&guest_tcp(guest_addr, remote, seq, Some(ack), TcpControl::None, &[]))
        .await;
    guest
        .send(&guest_tcp(guest_addr, remote, seq, Some(ack), TcpControl::Psh, b"PING"))
        .await;
    seq = seq.wrapping_add(4);

    let _external = accept.await.expect("listener task");

    let (pong_seq, payload) = guest
        .recv_matching(|frame| match frame {
            Frame::Tcp { src, payload, seq, .. } if *src == remote && !payload.is_empty() => {
                Some((*seq, payload.clone()))
            }
            _ => None,
        })
        .await;
    assert_eq!(payload, b"PONG");
    assert_eq!(pong_seq, ack);
    ack = ack.wrapping_add(payload.len() as u32);
    guest
        .send(&guest_tcp(guest_addr, remote, seq, Some(ack), TcpControl::None, &[]))
        .await;

    handle.shutdown();
}

/// Scenario: no listener on the host side. RST, not ICMP.
#[tokio::test]
async fn refused_dial_answers_rst() {
    // Grab a port that is certainly closed.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let (guest, handle, _dir) = start_gateway(vec![]).await;

    let guest_addr = SocketAddr::new(IpAddr::V4(GUEST4), 43211);
    let remote = SocketAddr::new(IpAddr::V4(HOST_NAT4), port);
    guest
        .send(&guest_tcp(guest_addr, remote, 5000, None, TcpControl::Syn, &[]))
        .await;

    let was_rst = guest
        .recv_matching(|frame| match frame {
            Frame::Tcp { src, rst, .. } if *src == remote => Some(*rst),
            Frame::Icmp4 { .. } => Some(false),
            _ => None,
        })
        .await;
    assert!(was_rst, "expected RST, saw ICMP or non-RST segment");

    handle.shutdown();
}

/// UDP out through the host-NAT alias and back; the reply must appear to
/// come from the alias, not the loopback.
#[tokio::test]
async fn udp_round_trip_presents_host_nat_alias() {
    let host_sock = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("host socket");
    let port = host_sock.local_addr().unwrap().port();

    let (guest, handle, _dir) = start_gateway(vec![]).await;

    let guest_addr = SocketAddr::new(IpAddr::V4(GUEST4), 40123);
    let remote = SocketAddr::new(IpAddr::V4(HOST_NAT4), port);
    guest.send(&guest_udp(guest_addr, remote, b"marco")).await;

    let mut buf = [0u8; 16];
    let (n, from) = tokio::time::timeout(common::RECV_TIMEOUT, host_sock.recv_from(&mut buf))
        .await
        .expect("datagram never reached the host")
        .expect("recv");
    assert_eq!(&buf[..n], b"marco");

    host_sock.send_to(b"polo", from).await.expect("reply");

    let (src, payload) = guest
        .recv_matching(|frame| match frame {
            Frame::Udp { src, dst, payload }
                if *dst == guest_addr && !payload.is_empty() =>
            {
                Some((*src, payload.clone()))
            }
            _ => None,
        })
        .await;
    assert_eq!(payload, b"polo");
    assert_eq!(src.ip(), IpAddr::V4(HOST_NAT4));
    assert_eq!(src.port(), port);

    handle.shutdown();
}

#[tokio::test]
async fn dns_static_zone_resolves_in_stack() {
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;

    let (guest, handle, _dir) = start_gateway(vec![]).await;

    let mut query = Message::new();
    query.set_id(0x4242).set_recursion_desired(true);
    query.add_query(Query::query(
        Name::from_str("host.internal.").unwrap(),
        RecordType::A,
    ));
    let wire = query.to_vec().unwrap();

    let guest_addr = SocketAddr::new(IpAddr::V4(GUEST4), 40555);
    let dns_addr = SocketAddr::new(IpAddr::V4(SERVICES4), 53);
    guest.send(&guest_udp(guest_addr, dns_addr, &wire)).await;

    let payload = guest
        .recv_matching(|frame| match frame {
            Frame::Udp { src, dst, payload } if *src == dns_addr && *dst == guest_addr => {
                Some(payload.clone())
            }
            _ => None,
        })
        .await;

    let response = Message::from_vec(&payload).expect("dns response");
    assert_eq!(response.id(), 0x4242);
    let answers = response.answers();
    assert_eq!(answers.len(), 1);
    match answers[0].data() {
        Some(RData::A(a)) => assert_eq!(a.0, HOST_NAT4),
        other => panic!("unexpected answer: {other:?}"),
    }

    handle.shutdown();
}

/// Host→guest forward: a host client reaches a "server" in the guest.
#[tokio::test]
async fn host_forward_dials_guest_through_stack() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
    let fwd_port = probe.local_addr().unwrap().port();
    drop(probe);

    let spec = gateway_protocol::forward::ForwardSpec::parse(
        &format!("tcp:127.0.0.1:{fwd_port}"),
        "tcp:8080",
    )
    .unwrap();
    let (guest, handle, _dir) = start_gateway(vec![spec]).await;

    let mut client = tokio::net::TcpStream::connect(("127.0.0.1", fwd_port))
        .await
        .expect("client connect");

    // The gateway dials the guest: expect a SYN for port 8080, spoofed
    // from the gateway address (the client is loopback).
    let (syn_src, syn_seq) = guest
        .recv_matching(|frame| match frame {
            Frame::Tcp {
                src,
                dst,
                syn: true,
                is_ack: false,
                seq,
                ..
            } if dst.port() == 8080 => Some((*src, *seq)),
            _ => None,
        })
        .await;
    assert_eq!(syn_src.ip(), IpAddr::V4(GATEWAY4));

    let guest_srv = SocketAddr::new(IpAddr::V4(GUEST4), 8080);
    let mut seq: u32 = 9000;
    let mut ack = syn_seq.wrapping_add(1);
    guest
        .send(&guest_tcp(guest_srv, syn_src, seq, Some(ack), TcpControl::Syn, &[]))
        .await;
    seq = seq.wrapping_add(1);

    // Gateway completes with an ACK.
    guest
        .recv_matching(|frame| match frame {
            Frame::Tcp {
                src, is_ack: true, syn: false, ..
            } if *src == syn_src => Some(()),
            _ => None,
        })
        .await;

    client.write_all(b"hello").await.expect("client write");
    let payload = guest
        .recv_matching(|frame| match frame {
            Frame::Tcp { src, payload, .. } if *src == syn_src && !payload.is_empty() => {
                Some(payload.clone())
            }
            _ => None,
        })
        .await;
    assert_eq!(payload, b"hello");
    ack = ack.wrapping_add(payload.len() as u32);

    guest
        .send(&guest_tcp(guest_srv, syn_src, seq, Some(ack), TcpControl::Psh, b"world"))
        .await;

    let mut reply = [0u8; 5];
    tokio::time::timeout(common::RECV_TIMEOUT, client.read_exact(&mut reply))
        .await
        .expect("reply never reached the client")
        .expect("client read");
    assert_eq!(&reply, b"world");

    handle.shutdown();
}
