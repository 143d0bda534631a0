//! UDP forwarding with connection tracking.
//!
//! Entries are keyed by the guest-side `(ip, port)`; each owns an external
//! socket and a reply task with a rolling 60 s deadline. A reverse map keyed
//! by the external socket's local port lets the ICMP forwarder restore the
//! guest's virtual 5-tuple inside nested error payloads; entries linger for
//! the conntrack timeout after teardown so late errors still resolve.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::nat::NatTable;
use crate::stack::{StackHandle, UdpMeta, UdpService};

/// Idle lifetime of a conntrack entry, refreshed by traffic either way.
pub const CONNTRACK_TTL: Duration = Duration::from_secs(60);

/// Reverse-map key: the external socket's local port, per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReverseKey {
    v6: bool,
    port: u16,
}

struct ReverseEntry {
    guest: SocketAddr,
    virtual_dst: SocketAddr,
    /// Set at flow teardown; the entry survives until then + TTL.
    expires_at: Option<Instant>,
}

/// Maps external local ports back to guest flows for ICMP fix-ups.
#[derive(Default)]
pub struct UdpReverseMap {
    entries: Mutex<HashMap<ReverseKey, ReverseEntry>>,
}

impl UdpReverseMap {
    fn insert(&self, local: SocketAddr, guest: SocketAddr, virtual_dst: SocketAddr) {
        let mut entries = self.entries.lock().expect("reverse map poisoned");
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at.map(|t| t > now).unwrap_or(true));
        entries.insert(
            ReverseKey {
                v6: local.is_ipv6(),
                port: local.port(),
            },
            ReverseEntry {
                guest,
                virtual_dst,
                expires_at: None,
            },
        );
    }

    fn mark_closed(&self, local: SocketAddr) {
        let mut entries = self.entries.lock().expect("reverse map poisoned");
        if let Some(entry) = entries.get_mut(&ReverseKey {
            v6: local.is_ipv6(),
            port: local.port(),
        }) {
            entry.expires_at = Some(Instant::now() + CONNTRACK_TTL);
        }
    }

    /// The guest source and the destination as the guest addressed it, for
    /// a flow whose external socket used `port` in the given family.
    pub fn lookup(&self, v6: bool, port: u16) -> Option<(SocketAddr, SocketAddr)> {
        let entries = self.entries.lock().expect("reverse map poisoned");
        let entry = entries.get(&ReverseKey { v6, port })?;
        if let Some(expires) = entry.expires_at {
            if expires <= Instant::now() {
                return None;
            }
        }
        Some((entry.guest, entry.virtual_dst))
    }
}

struct UdpFlow {
    socket: Arc<UdpSocket>,
    last_ttl: AtomicU8,
    last_activity: Mutex<Instant>,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_activity.lock().expect("flow clock poisoned") = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("flow clock poisoned")
            .elapsed()
    }
}

struct Inner {
    stack: StackHandle,
    nat: Arc<NatTable>,
    flows: Mutex<HashMap<SocketAddr, Arc<UdpFlow>>>,
    reverse: Arc<UdpReverseMap>,
}

/// The stack's UDP fallback: everything not claimed by an in-stack service.
pub struct UdpForwarder {
    inner: Arc<Inner>,
}

impl UdpForwarder {
    pub fn new(stack: StackHandle, nat: Arc<NatTable>, reverse: Arc<UdpReverseMap>) -> Self {
        Self {
            inner: Arc::new(Inner {
                stack,
                nat,
                flows: Mutex::new(HashMap::new()),
                reverse,
            }),
        }
    }

    pub fn reverse_map(&self) -> Arc<UdpReverseMap> {
        self.inner.reverse.clone()
    }
}

impl UdpService for UdpForwarder {
    fn datagram(&self, meta: UdpMeta, payload: Vec<u8>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.handle(meta, payload).await;
        });
    }
}

impl Inner {
    async fn handle(self: Arc<Self>, meta: UdpMeta, payload: Vec<u8>) {
        let (ext_dst, _) = self.nat.rewrite(meta.local);

        let flow = match self.flow_for(&meta, ext_dst).await {
            Some(flow) => flow,
            None => return,
        };

        // Copy the guest's TTL onto the external socket when it changes.
        let ttl = meta.ttl;
        if flow.last_ttl.swap(ttl, Ordering::Relaxed) != ttl {
            let sock = SockRef::from(flow.socket.as_ref());
            let result = if ext_dst.is_ipv6() {
                sock.set_unicast_hops_v6(ttl as u32)
            } else {
                sock.set_ttl(ttl as u32)
            };
            if let Err(e) = result {
                trace!(error = %e, "ttl copy failed");
            }
        }

        flow.touch();
        match flow.socket.send_to(&payload, ext_dst).await {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                // Transient buffer exhaustion; UDP is allowed to drop.
            }
            Err(e) => debug!(dst = %ext_dst, error = %e, "udp send failed, dropped"),
        }
    }

    async fn flow_for(self: &Arc<Self>, meta: &UdpMeta, ext_dst: SocketAddr) -> Option<Arc<UdpFlow>> {
        if let Some(flow) = self
            .flows
            .lock()
            .expect("conntrack poisoned")
            .get(&meta.guest)
        {
            return Some(flow.clone());
        }

        let bind_addr: SocketAddr = if ext_dst.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "udp socket bind failed");
                return None;
            }
        };
        let local = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "udp local addr failed");
                return None;
            }
        };

        let flow = Arc::new(UdpFlow {
            socket: socket.clone(),
            last_ttl: AtomicU8::new(64),
            last_activity: Mutex::new(Instant::now()),
        });

        let mut flows = self.flows.lock().expect("conntrack poisoned");
        // Lost the race: another datagram built the flow first.
        if let Some(existing) = flows.get(&meta.guest) {
            return Some(existing.clone());
        }
        flows.insert(meta.guest, flow.clone());
        drop(flows);

        self.reverse.insert(local, meta.guest, meta.local);

        let inner = self.clone();
        let guest = meta.guest;
        let reply_flow = flow.clone();
        tokio::spawn(async move {
            inner.reply_loop(guest, local, reply_flow).await;
        });

        Some(flow)
    }

    /// Pump replies back to the guest until the rolling deadline lapses or
    /// the socket errors. Teardown keeps the reverse entry alive for late
    /// ICMP fix-ups.
    async fn reply_loop(self: Arc<Self>, guest: SocketAddr, local: SocketAddr, flow: Arc<UdpFlow>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let wait = CONNTRACK_TTL.saturating_sub(flow.idle());
            if wait.is_zero() {
                trace!(%guest, "udp conntrack expired");
                break;
            }
            match tokio::time::timeout(wait, flow.socket.recv_from(&mut buf)).await {
                Err(_) => continue, // re-check the rolling deadline
                Ok(Err(e)) => {
                    debug!(%guest, error = %e, "udp reply socket error");
                    break;
                }
                Ok(Ok((n, src))) => {
                    flow.touch();
                    // Replies from a loopback the guest reached through the
                    // host-NAT alias are presented as that alias.
                    let present_ip = self.nat.inverse(src.ip()).unwrap_or(src.ip());
                    self.stack.send_udp(
                        SocketAddr::new(present_ip, src.port()),
                        guest,
                        &buf[..n],
                    );
                }
            }
        }

        self.flows
            .lock()
            .expect("conntrack poisoned")
            .remove(&guest);
        self.reverse.mark_closed(local);
    }
}
