//! Host-side UDP listener mirror.
//!
//! Accepts datagrams on a host socket and relays them to a guest UDP port
//! through the stack. Each host client gets its own in-stack endpoint (a
//! gateway-sourced ephemeral port) so guest replies find their way back to
//! the right client; idle clients expire on the conntrack timeout.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::forward::udp::CONNTRACK_TTL;
use crate::stack::{StackHandle, UdpMeta, UdpService, GATEWAY4, GUEST4};

struct ClientEntry {
    in_stack: SocketAddr,
    last_active: Arc<Mutex<Instant>>,
}

/// Relays guest replies arriving on one client's in-stack endpoint back to
/// that client through the host socket.
struct ReplyRelay {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    last_active: Arc<Mutex<Instant>>,
}

impl UdpService for ReplyRelay {
    fn datagram(&self, _meta: UdpMeta, payload: Vec<u8>) {
        *self.last_active.lock().expect("relay clock poisoned") = Instant::now();
        let socket = self.socket.clone();
        let client = self.client;
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&payload, client).await {
                trace!(%client, error = %e, "udp proxy reply failed");
            }
        });
    }
}

pub async fn run(
    socket: UdpSocket,
    stack: StackHandle,
    guest_port: u16,
    mut stop: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let guest = SocketAddr::new(IpAddr::V4(GUEST4), guest_port);
    let mut clients: HashMap<SocketAddr, ClientEntry> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    let mut sweep = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, client) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "udp proxy recv failed");
                        continue;
                    }
                };

                let entry = match clients.get(&client) {
                    Some(entry) => {
                        *entry.last_active.lock().expect("relay clock poisoned") =
                            Instant::now();
                        entry
                    }
                    None => {
                        match register_client(&stack, &socket, client) {
                            Some(entry) => {
                                debug!(%client, "udp proxy client added");
                                clients.entry(client).or_insert(entry)
                            }
                            None => continue,
                        }
                    }
                };
                stack.send_udp(entry.in_stack, guest, &buf[..n]);
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                clients.retain(|client, entry| {
                    let idle = now.duration_since(
                        *entry.last_active.lock().expect("relay clock poisoned"),
                    );
                    if idle > CONNTRACK_TTL {
                        trace!(%client, "udp proxy client expired");
                        stack.unbind_udp(entry.in_stack);
                        false
                    } else {
                        true
                    }
                });
            }
            _ = stop.changed() => break,
        }
    }

    for entry in clients.values() {
        stack.unbind_udp(entry.in_stack);
    }
}

/// Allocate an in-stack endpoint for a host client, retrying ephemeral
/// port collisions.
fn register_client(
    stack: &StackHandle,
    socket: &Arc<UdpSocket>,
    client: SocketAddr,
) -> Option<ClientEntry> {
    let last_active = Arc::new(Mutex::new(Instant::now()));
    for _ in 0..8 {
        let port = 32768 + (rand::random::<u16>() % 28000);
        let in_stack = SocketAddr::new(IpAddr::V4(GATEWAY4), port);
        let relay = Arc::new(ReplyRelay {
            socket: socket.clone(),
            client,
            last_active: last_active.clone(),
        });
        if stack.bind_udp(in_stack, relay).is_ok() {
            return Some(ClientEntry {
                in_stack,
                last_active,
            });
        }
    }
    warn!(%client, "no in-stack port available for udp proxy client");
    None
}
