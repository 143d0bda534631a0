//! Outbound TCP forwarding.
//!
//! Every guest SYN not claimed by an in-stack service lands here as a
//! parked [`ConnectRequest`]. The external side is dialed first, through
//! the proxy manager with host-NAT remapping, and only a successful dial
//! completes the handshake. Failures translate per the error grammar:
//! refused/reset answer RST, unreachable networks inject ICMP errors, and
//! timeouts go silent so the guest's own timer fires.

use std::sync::Arc;

use smoltcp::wire::{Icmpv4DstUnreachable, Icmpv6DstUnreachable};
use tracing::{debug, trace};

use super::{classify_dial_error, DialFailure};
use crate::proxy::ProxyManager;
use crate::stack::vtcp::{ConnectRequest, SynPacketInfo};
use crate::stack::{frames, StackHandle, TcpAcceptor};

/// External-side `TCP_NODELAY` is applied when either port is one of
/// these: SSH, Minecraft, Docker, NFS, vcontrol, hcontrol.
const NODELAY_PORTS: [u16; 6] = [22, 25565, 2375, 2049, 8300, 8301];

struct Inner {
    stack: StackHandle,
    proxy: Arc<ProxyManager>,
}

pub struct TcpForwarder {
    inner: Arc<Inner>,
}

impl TcpForwarder {
    pub fn new(stack: StackHandle, proxy: Arc<ProxyManager>) -> Self {
        Self {
            inner: Arc::new(Inner { stack, proxy }),
        }
    }
}

impl TcpAcceptor for TcpForwarder {
    fn incoming(&self, req: ConnectRequest) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.handle(req).await });
    }
}

impl Inner {
    async fn handle(self: Arc<Self>, req: ConnectRequest) {
        let local = req.local();
        let peer = req.peer();

        let external = match self.proxy.dial_forward(local).await {
            Ok(external) => external,
            Err(e) => {
                trace!(dst = %local, error = %e, "forward dial failed");
                match classify_dial_error(&e) {
                    DialFailure::Refused => req.refuse(),
                    DialFailure::NetUnreachable => {
                        self.inject_unreachable(&req, DialFailure::NetUnreachable);
                        req.abandon();
                    }
                    DialFailure::HostUnreachable => {
                        self.inject_unreachable(&req, DialFailure::HostUnreachable);
                        req.abandon();
                    }
                    DialFailure::Other => req.abandon(),
                }
                return;
            }
        };

        if NODELAY_PORTS.contains(&local.port()) || NODELAY_PORTS.contains(&peer.port()) {
            external.set_nodelay(true);
        }
        external.set_keepalive_off();

        let stream = match req.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(dst = %local, error = %e, "handshake completion failed");
                return;
            }
        };

        let (to_external, to_guest) =
            crate::hostfwd::pump::pump_bidirectional(stream, external).await;
        trace!(
            dst = %local,
            out = to_external.map(|n| n as i64).unwrap_or(-1),
            back = to_guest.map(|n| n as i64).unwrap_or(-1),
            "forwarded flow finished"
        );
    }

    /// Family-appropriate ICMP unreachable back to the guest, embedding
    /// the original SYN's header + 8 bytes.
    fn inject_unreachable(&self, req: &ConnectRequest, failure: DialFailure) {
        match req.syn_info() {
            SynPacketInfo::V4 { header, data } => {
                let reason = match failure {
                    DialFailure::NetUnreachable => Icmpv4DstUnreachable::NetUnreachable,
                    _ => Icmpv4DstUnreachable::HostUnreachable,
                };
                self.stack
                    .inject_frame(frames::icmpv4_unreachable(reason, &header, &data));
            }
            SynPacketInfo::V6 { header, data } => {
                let reason = match failure {
                    DialFailure::NetUnreachable => Icmpv6DstUnreachable::NoRoute,
                    _ => Icmpv6DstUnreachable::AddrUnreachable,
                };
                self.stack
                    .inject_frame(frames::icmpv6_unreachable(reason, &header, &data));
            }
        }
    }
}
