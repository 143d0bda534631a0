//! Host-side port forwarding into the guest.
//!
//! A registered [`ForwardSpec`] opens a host listener and bridges each
//! accepted stream or datagram flow to the guest: TCP and Unix listeners
//! dial the guest through the stack (spoofing the client's source address
//! where it is routable), vsock targets go through the dialer injected by
//! the hypervisor glue, and UDP listeners run the [`udp_proxy`] mirror.
//!
//! Privileged loopback ports (< 1024) are listened on the wildcard address
//! of the same family with non-loopback peers filtered on accept, which
//! yields privileged-port semantics without elevation.

pub mod pump;
pub mod udp_proxy;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_protocol::forward::{ForwardSpec, ForwardTarget, ListenEndpoint};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::stack::{StackHandle, GATEWAY4, GATEWAY6, GUEST4, GUEST6};
use crate::{Error, Result};

/// Anything pumpable; vsock dialers return these.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Supplied by the hypervisor glue: open a stream to a guest vsock port.
#[async_trait]
pub trait VsockDial: Send + Sync {
    async fn dial(&self, port: u32) -> io::Result<Box<dyn AsyncStream>>;
}

struct ActiveForward {
    spec: ForwardSpec,
    stop: watch::Sender<bool>,
}

/// Owns every registered forward; listeners release on [`stop`] or when
/// the router shuts down.
///
/// [`stop`]: ForwardRouter::stop
pub struct ForwardRouter {
    stack: StackHandle,
    vsock: Option<Arc<dyn VsockDial>>,
    active: Mutex<HashMap<ListenEndpoint, ActiveForward>>,
}

impl ForwardRouter {
    pub fn new(stack: StackHandle, vsock: Option<Arc<dyn VsockDial>>) -> Self {
        Self {
            stack,
            vsock,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register and start a forward. Specs are unique by their listen
    /// endpoint.
    pub async fn start(&self, spec: ForwardSpec) -> Result<()> {
        if !spec.supported() {
            return Err(Error::Forward(format!(
                "unsupported forward combination {spec}"
            )));
        }
        {
            let active = self.active.lock().expect("forward registry poisoned");
            if active.contains_key(&spec.from) {
                return Err(Error::Forward(format!(
                    "forward from {} already registered",
                    spec.from
                )));
            }
        }

        let (stop, stop_rx) = watch::channel(false);

        match (&spec.from, &spec.to) {
            (ListenEndpoint::Tcp { addr }, ForwardTarget::Tcp { port }) => {
                let listener = bind_tcp(*addr).await?;
                let stack = self.stack.clone();
                let guest_port = *port;
                let filter_loopback = wants_loopback_filter(*addr);
                tokio::spawn(async move {
                    tcp_accept_loop(listener, stop_rx, filter_loopback, move |conn, peer| {
                        let stack = stack.clone();
                        async move { bridge_tcp_to_guest(stack, conn, peer, guest_port).await }
                    })
                    .await;
                });
            }
            (ListenEndpoint::Tcp { addr }, ForwardTarget::Vsock { port }) => {
                let Some(vsock) = self.vsock.clone() else {
                    return Err(Error::Forward("no vsock dialer available".into()));
                };
                let listener = bind_tcp(*addr).await?;
                let vsock_port = *port;
                let filter_loopback = wants_loopback_filter(*addr);
                tokio::spawn(async move {
                    tcp_accept_loop(listener, stop_rx, filter_loopback, move |conn, peer| {
                        let vsock = vsock.clone();
                        async move {
                            match vsock.dial(vsock_port).await {
                                Ok(stream) => {
                                    let (out, back) = pump::pump_bidirectional(conn, stream).await;
                                    trace!(
                                        %peer,
                                        vsock_port,
                                        out = out.unwrap_or(0),
                                        back = back.unwrap_or(0),
                                        "vsock forward finished"
                                    );
                                }
                                Err(e) => {
                                    debug!(vsock_port, error = %e, "vsock dial failed");
                                }
                            }
                        }
                    })
                    .await;
                });
            }
            (ListenEndpoint::Udp { addr }, ForwardTarget::Udp { port }) => {
                let socket = UdpSocket::bind(*addr)
                    .await
                    .map_err(|e| Error::Forward(format!("udp bind {addr}: {e}")))?;
                let stack = self.stack.clone();
                let guest_port = *port;
                tokio::spawn(async move {
                    udp_proxy::run(socket, stack, guest_port, stop_rx).await;
                });
            }
            (ListenEndpoint::Unix { path }, ForwardTarget::Tcp { port }) => {
                // A stale socket file from a previous run blocks the bind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| Error::Forward(format!("unix bind {}: {e}", path.display())))?;
                let stack = self.stack.clone();
                let guest_port = *port;
                tokio::spawn(async move {
                    unix_accept_loop(listener, stop_rx, move |conn| {
                        let stack = stack.clone();
                        async move {
                            let gateway = SocketAddr::new(IpAddr::V4(GATEWAY4), 0);
                            bridge_stream_to_guest(stack, conn, gateway, guest_port).await;
                        }
                    })
                    .await;
                });
            }
            _ => unreachable!("supported() covers the routing table"),
        }

        info!(%spec, "forward registered");
        self.active
            .lock()
            .expect("forward registry poisoned")
            .insert(spec.from.clone(), ActiveForward { spec, stop });
        Ok(())
    }

    /// Release one forward by its listen endpoint.
    pub fn stop(&self, from: &ListenEndpoint) -> Result<()> {
        let mut active = self.active.lock().expect("forward registry poisoned");
        match active.remove(from) {
            Some(fw) => {
                let _ = fw.stop.send(true);
                if let ListenEndpoint::Unix { path } = from {
                    let _ = std::fs::remove_file(path);
                }
                info!(spec = %fw.spec, "forward released");
                Ok(())
            }
            None => Err(Error::Forward(format!("no forward from {from}"))),
        }
    }

    pub fn list(&self) -> Vec<ForwardSpec> {
        self.active
            .lock()
            .expect("forward registry poisoned")
            .values()
            .map(|fw| fw.spec.clone())
            .collect()
    }

    /// Release everything; called on gateway shutdown.
    pub fn shutdown_all(&self) {
        let mut active = self.active.lock().expect("forward registry poisoned");
        for (from, fw) in active.drain() {
            let _ = fw.stop.send(true);
            if let ListenEndpoint::Unix { path } = &from {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Loopback listeners on privileged ports move to the wildcard address and
/// filter remotes instead.
fn wants_loopback_filter(addr: SocketAddr) -> bool {
    addr.port() < 1024 && addr.ip().is_loopback()
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let effective = if wants_loopback_filter(addr) {
        let wildcard = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(wildcard, addr.port())
    } else {
        addr
    };
    TcpListener::bind(effective)
        .await
        .map_err(|e| Error::Forward(format!("tcp bind {effective}: {e}")))
}

async fn tcp_accept_loop<F, Fut>(
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
    filter_loopback: bool,
    handler: F,
) where
    F: Fn(tokio::net::TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    if filter_loopback && !peer.ip().is_loopback() {
                        debug!(%peer, "non-loopback peer rejected on privileged forward");
                        continue;
                    }
                    tokio::spawn(handler(conn, peer));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = stop.changed() => break,
        }
    }
}

async fn unix_accept_loop<F, Fut>(listener: UnixListener, mut stop: watch::Receiver<bool>, handler: F)
where
    F: Fn(tokio::net::UnixStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => {
                    tokio::spawn(handler(conn));
                }
                Err(e) => {
                    warn!(error = %e, "unix accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = stop.changed() => break,
        }
    }
}

/// Spoofed source for a guest-bound dial: the client's own address when it
/// is routable on the virtual subnet's view of the world, otherwise a
/// gateway-sourced ephemeral. Loopback clients always synthesize.
fn spoof_source(peer: SocketAddr, guest_v6: bool) -> SocketAddr {
    if peer.ip().is_loopback() {
        let gw = if guest_v6 {
            IpAddr::V6(GATEWAY6)
        } else {
            IpAddr::V4(GATEWAY4)
        };
        SocketAddr::new(gw, 0)
    } else {
        peer
    }
}

async fn bridge_tcp_to_guest(
    stack: StackHandle,
    conn: tokio::net::TcpStream,
    peer: SocketAddr,
    guest_port: u16,
) {
    let source = spoof_source(peer, false);
    bridge_stream_to_guest(stack, conn, source, guest_port).await;
}

/// Dial the guest through the stack and pump. A zero source port picks a
/// random ephemeral, retrying collisions.
async fn bridge_stream_to_guest<S>(
    stack: StackHandle,
    conn: S,
    mut source: SocketAddr,
    guest_port: u16,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let guest = match source.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(GUEST4), guest_port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(GUEST6), guest_port),
    };

    let mut attempts = 0u32;
    let stream = loop {
        let candidate = if source.port() == 0 {
            SocketAddr::new(source.ip(), ephemeral_port())
        } else {
            source
        };
        match stack.connect_guest(candidate, guest).await {
            Ok(stream) => break stream,
            Err(e) if source.port() == 0 && attempts < 4 => {
                attempts += 1;
                trace!(error = %e, "guest dial retry");
            }
            Err(e) => {
                debug!(%guest, error = %e, "guest dial failed");
                return;
            }
        }
        source = SocketAddr::new(source.ip(), 0);
    };

    let (out, back) = pump::pump_bidirectional(conn, stream).await;
    trace!(
        %guest,
        out = out.unwrap_or(0),
        back = back.unwrap_or(0),
        "host forward finished"
    );
}

fn ephemeral_port() -> u16 {
    32768 + (rand::random::<u16>() % 28000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_filter_trigger() {
        assert!(wants_loopback_filter("127.0.0.1:80".parse().unwrap()));
        assert!(wants_loopback_filter("[::1]:443".parse().unwrap()));
        assert!(!wants_loopback_filter("127.0.0.1:8080".parse().unwrap()));
        assert!(!wants_loopback_filter("0.0.0.0:80".parse().unwrap()));
    }

    #[test]
    fn source_spoofing_rules() {
        let external: SocketAddr = "192.168.1.9:55001".parse().unwrap();
        assert_eq!(spoof_source(external, false), external);

        let loopback: SocketAddr = "127.0.0.1:55001".parse().unwrap();
        let spoofed = spoof_source(loopback, false);
        assert_eq!(spoofed.ip(), IpAddr::V4(GATEWAY4));
        assert_eq!(spoofed.port(), 0);
    }

    #[test]
    fn ephemeral_ports_in_range() {
        for _ in 0..64 {
            let p = ephemeral_port();
            assert!((32768..60768).contains(&p));
        }
    }
}
