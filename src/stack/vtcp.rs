//! Per-flow virtual TCP.
//!
//! The link to the guest is lossless and ordered, so this machine carries
//! no retransmission state: sequence numbers exist to interoperate with the
//! guest's real stack, and flow control degenerates to window bookkeeping.
//! Each flow is exposed to the rest of the gateway as a [`VtcpStream`]
//! (plain `AsyncRead + AsyncWrite`), with half-close preserved end-to-end:
//! shutting down the write half sends FIN, a guest FIN surfaces as EOF.
//!
//! Passive opens are not completed eagerly. A SYN parks as a
//! [`ConnectRequest`] until the acceptor has a dialed external socket, then
//! `accept()` emits the SYN-ACK, or `refuse()` answers RST, or the request
//! is abandoned for the ICMP-unreachable path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use smoltcp::wire::{Ipv4Repr, Ipv6Repr, TcpControl, TcpPacket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, trace};

use super::frames::{self, TcpSegment};
use crate::{Error, Result};

/// Bytes of guest→app data we hold before shrinking the advertised window.
const RECV_WINDOW: usize = 64 * 1024 - 1;

/// Bytes of app→guest data queued per flow before writers block.
const SEND_QUEUE: usize = 256 * 1024;

/// Capacity of the duplex pipe between the engine pumps and the consumer.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Active opens and parked SYNs give up after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// One end of a flow: `local` is the address the stack impersonates,
/// `guest` is the guest-side endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local: SocketAddr,
    pub guest: SocketAddr,
}

/// IP header + first 8 payload bytes of the SYN, kept for RFC 792 / 4443
/// unreachable synthesis.
#[derive(Debug, Clone, Copy)]
pub enum SynPacketInfo {
    V4 { header: Ipv4Repr, data: [u8; 8] },
    V6 { header: Ipv6Repr, data: [u8; 8] },
}

pub enum Command {
    Connect {
        key: FlowKey,
        reply: oneshot::Sender<Result<VtcpStream>>,
    },
    Accept {
        key: FlowKey,
        reply: oneshot::Sender<Result<VtcpStream>>,
    },
    Refuse {
        key: FlowKey,
    },
    Abandon {
        key: FlowKey,
    },
    Write {
        key: FlowKey,
        data: Vec<u8>,
    },
    Fin {
        key: FlowKey,
    },
    Abort {
        key: FlowKey,
    },
}

/// A parked inbound SYN. Exactly one of `accept`/`refuse`/`abandon` decides
/// its fate; dropping the request without deciding counts as abandoning.
pub struct ConnectRequest {
    key: FlowKey,
    syn: SynPacketInfo,
    cmd: mpsc::UnboundedSender<Command>,
    decided: bool,
}

impl ConnectRequest {
    /// The address the guest was dialing.
    pub fn local(&self) -> SocketAddr {
        self.key.local
    }

    /// The guest-side source.
    pub fn peer(&self) -> SocketAddr {
        self.key.guest
    }

    /// The invoking packet material for ICMP error synthesis.
    pub fn syn_info(&self) -> SynPacketInfo {
        self.syn
    }

    /// Complete the handshake; the SYN-ACK goes out before this resolves.
    pub async fn accept(mut self) -> Result<VtcpStream> {
        self.decided = true;
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::Accept {
                key: self.key,
                reply,
            })
            .map_err(|_| Error::Stack("stack is gone".into()))?;
        rx.await.map_err(|_| Error::Stack("stack is gone".into()))?
    }

    /// Answer the SYN with RST.
    pub fn refuse(mut self) {
        self.decided = true;
        let _ = self.cmd.send(Command::Refuse { key: self.key });
    }

    /// Complete without RST; used when an ICMP unreachable is injected
    /// instead, or the dial just timed out.
    pub fn abandon(mut self) {
        self.decided = true;
        let _ = self.cmd.send(Command::Abandon { key: self.key });
    }
}

impl Drop for ConnectRequest {
    fn drop(&mut self) {
        if !self.decided {
            let _ = self.cmd.send(Command::Abandon { key: self.key });
        }
    }
}

// ---------------------------------------------------------------------------
// Stream handed to forwarders and services
// ---------------------------------------------------------------------------

/// The application face of a flow.
pub struct VtcpStream {
    io: DuplexStream,
    local: SocketAddr,
    peer: SocketAddr,
}

impl VtcpStream {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_split(
        self,
    ) -> (
        tokio::io::ReadHalf<DuplexStream>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        tokio::io::split(self.io)
    }
}

impl AsyncRead for VtcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for VtcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum FlowState {
    /// Inbound SYN parked, no SYN-ACK sent yet.
    SynParked,
    /// SYN-ACK sent, waiting for the guest's ACK.
    SynReceived,
    /// Outbound SYN sent (active open toward the guest).
    SynSent,
    Established,
}

enum Delivery {
    Data(Vec<u8>),
    Fin,
    Rst,
}

struct Flow {
    state: FlowState,
    /// Next sequence number we will send.
    snd_nxt: u32,
    /// Highest cumulative ack from the guest.
    snd_una: u32,
    /// Next sequence number expected from the guest.
    rcv_nxt: u32,
    /// Last window the guest advertised.
    guest_window: u32,
    mss: usize,
    out_queue: Vec<u8>,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    rx_closed: bool,
    to_pump: Option<mpsc::UnboundedSender<Delivery>>,
    recv_buffered: Arc<AtomicUsize>,
    send_permits: Arc<Semaphore>,
    closed_tx: Option<watch::Sender<bool>>,
    connect_reply: Option<oneshot::Sender<Result<VtcpStream>>>,
    opened_at: Instant,
}

impl Flow {
    fn advertised_window(&self) -> u16 {
        let buffered = self.recv_buffered.load(Ordering::Relaxed);
        RECV_WINDOW.saturating_sub(buffered).min(u16::MAX as usize) as u16
    }

    fn inflight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }
}

pub struct Engine {
    flows: HashMap<FlowKey, Flow>,
    egress: mpsc::UnboundedSender<Vec<u8>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    mtu: usize,
    parked: usize,
}

impl Engine {
    pub fn new(
        egress: mpsc::UnboundedSender<Vec<u8>>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        mtu: usize,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            egress,
            cmd_tx,
            mtu,
            parked: 0,
        }
    }

    /// SYNs currently awaiting an accept/refuse decision.
    pub fn parked(&self) -> usize {
        self.parked
    }

    fn mss_for(&self, key: &FlowKey) -> usize {
        match key.guest {
            SocketAddr::V4(_) => self.mtu - 40,
            SocketAddr::V6(_) => self.mtu - 60,
        }
    }

    fn emit(&self, frame: Vec<u8>) {
        let _ = self.egress.send(frame);
    }

    /// Inbound segment from the guest. `syn_info` carries the raw IP header
    /// and first payload bytes for possible ICMP synthesis.
    pub fn handle_segment(
        &mut self,
        key: FlowKey,
        tcp: &TcpPacket<&[u8]>,
        syn_info: SynPacketInfo,
        on_syn: &mut dyn FnMut(ConnectRequest),
    ) {
        let seq = tcp.seq_number().0 as u32;

        if tcp.syn() && !tcp.ack() {
            match self.flows.get(&key) {
                // Retransmitted SYN for a parked or handshaking flow.
                Some(_) => return,
                None => {
                    let flow = Flow {
                        state: FlowState::SynParked,
                        snd_nxt: 0,
                        snd_una: 0,
                        rcv_nxt: seq.wrapping_add(1),
                        guest_window: tcp.window_len() as u32,
                        mss: self.mss_for(&key),
                        out_queue: Vec::new(),
                        fin_queued: false,
                        fin_sent: false,
                        fin_acked: false,
                        rx_closed: false,
                        to_pump: None,
                        recv_buffered: Arc::new(AtomicUsize::new(0)),
                        send_permits: Arc::new(Semaphore::new(SEND_QUEUE)),
                        closed_tx: None,
                        connect_reply: None,
                        opened_at: Instant::now(),
                    };
                    self.flows.insert(key, flow);
                    self.parked += 1;
                    on_syn(ConnectRequest {
                        key,
                        syn: syn_info,
                        cmd: self.cmd_tx.clone(),
                        decided: false,
                    });
                    return;
                }
            }
        }

        let Some(flow) = self.flows.get_mut(&key) else {
            // No flow: answer anything but an RST with an RST.
            if !tcp.rst() {
                let (rst_seq, rst_ack) = if tcp.ack() {
                    (tcp.ack_number().0 as u32, seq)
                } else {
                    (0, seq.wrapping_add(tcp.payload().len() as u32))
                };
                self.emit(frames::tcp_segment(
                    &TcpSegment {
                        local: key.local,
                        guest: key.guest,
                        seq: rst_seq,
                        ack: Some(rst_ack),
                        window: 0,
                        control: TcpControl::Rst,
                        mss: None,
                    },
                    &[],
                ));
            }
            return;
        };

        flow.guest_window = tcp.window_len() as u32;

        if tcp.rst() {
            trace!(?key, "guest reset");
            if flow.state == FlowState::SynParked {
                self.parked -= 1;
            }
            Self::teardown(flow, true);
            self.flows.remove(&key);
            return;
        }

        if tcp.ack() {
            let ack = tcp.ack_number().0 as u32;
            let newly = ack.wrapping_sub(flow.snd_una);
            if newly > 0 && newly < (1 << 30) {
                flow.snd_una = ack;
            }
            match flow.state {
                FlowState::SynReceived => {
                    if flow.snd_una == flow.snd_nxt {
                        flow.state = FlowState::Established;
                    }
                }
                FlowState::SynSent => {
                    // Expect SYN-ACK for our active open.
                    if tcp.syn() {
                        flow.rcv_nxt = seq.wrapping_add(1);
                        flow.state = FlowState::Established;
                        self.finish_open(&key);
                        // Re-borrow after finish_open.
                        let flow = self.flows.get_mut(&key).expect("flow vanished");
                        Self::emit_ack(&self.egress, &key, flow);
                        // Flush anything the application queued while the
                        // handshake was in flight.
                        self.pump_out(&key);
                    }
                    return;
                }
                _ => {}
            }
            if flow.fin_sent && flow.snd_una == flow.snd_nxt {
                flow.fin_acked = true;
            }
        }

        if flow.state == FlowState::SynParked {
            // Nothing but a retransmitted SYN is expected here; data before
            // the handshake completes is dropped.
            return;
        }

        let payload = tcp.payload();
        if !payload.is_empty() && flow.state == FlowState::Established {
            if seq == flow.rcv_nxt && !flow.rx_closed {
                flow.rcv_nxt = flow.rcv_nxt.wrapping_add(payload.len() as u32);
                flow.recv_buffered
                    .fetch_add(payload.len(), Ordering::Relaxed);
                if let Some(tx) = &flow.to_pump {
                    let _ = tx.send(Delivery::Data(payload.to_vec()));
                }
                Self::emit_ack(&self.egress, &key, flow);
            } else {
                // Duplicate or out-of-window: restate our position.
                Self::emit_ack(&self.egress, &key, flow);
            }
        }

        if tcp.fin() && !flow.rx_closed && seq.wrapping_add(payload.len() as u32) == flow.rcv_nxt {
            flow.rcv_nxt = flow.rcv_nxt.wrapping_add(1);
            flow.rx_closed = true;
            if let Some(tx) = &flow.to_pump {
                let _ = tx.send(Delivery::Fin);
            }
            Self::emit_ack(&self.egress, &key, flow);
        }

        self.pump_out(&key);
        self.reap(&key);
    }

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { key, reply } => self.active_open(key, reply),
            Command::Accept { key, reply } => self.accept_parked(key, reply),
            Command::Refuse { key } => {
                if let Some(mut flow) = self.flows.remove(&key) {
                    if flow.state == FlowState::SynParked {
                        self.parked -= 1;
                    }
                    // RST answering the parked SYN: seq 0 is what the guest
                    // expects before our ISN exists.
                    self.emit(frames::tcp_segment(
                        &TcpSegment {
                            local: key.local,
                            guest: key.guest,
                            seq: 0,
                            ack: Some(flow.rcv_nxt),
                            window: 0,
                            control: TcpControl::Rst,
                            mss: None,
                        },
                        &[],
                    ));
                    Self::teardown(&mut flow, false);
                }
            }
            Command::Abandon { key } => {
                if let Some(mut flow) = self.flows.remove(&key) {
                    if flow.state == FlowState::SynParked {
                        self.parked -= 1;
                    }
                    Self::teardown(&mut flow, false);
                }
            }
            Command::Write { key, data } => {
                if let Some(flow) = self.flows.get_mut(&key) {
                    if !flow.fin_queued {
                        flow.out_queue.extend_from_slice(&data);
                    }
                    self.pump_out(&key);
                } else {
                    trace!(?key, "write for dead flow dropped");
                }
            }
            Command::Fin { key } => {
                if let Some(flow) = self.flows.get_mut(&key) {
                    flow.fin_queued = true;
                    self.pump_out(&key);
                    self.reap(&key);
                }
            }
            Command::Abort { key } => {
                if let Some(mut flow) = self.flows.remove(&key) {
                    if flow.state != FlowState::SynParked {
                        self.emit(frames::tcp_segment(
                            &TcpSegment {
                                local: key.local,
                                guest: key.guest,
                                seq: flow.snd_nxt,
                                ack: Some(flow.rcv_nxt),
                                window: 0,
                                control: TcpControl::Rst,
                                mss: None,
                            },
                            &[],
                        ));
                    }
                    Self::teardown(&mut flow, false);
                }
            }
        }
    }

    /// Periodic housekeeping: expire handshakes that never completed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| {
                matches!(
                    f.state,
                    FlowState::SynParked | FlowState::SynReceived | FlowState::SynSent
                ) && now.duration_since(f.opened_at) > HANDSHAKE_TIMEOUT
            })
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            debug!(?key, "handshake expired");
            if let Some(mut flow) = self.flows.remove(&key) {
                if flow.state == FlowState::SynParked {
                    self.parked -= 1;
                }
                if let Some(reply) = flow.connect_reply.take() {
                    let _ = reply.send(Err(Error::Timeout("tcp handshake".into())));
                }
                Self::teardown(&mut flow, false);
            }
        }
    }

    fn active_open(&mut self, key: FlowKey, reply: oneshot::Sender<Result<VtcpStream>>) {
        if self.flows.contains_key(&key) {
            let _ = reply.send(Err(Error::Stack(format!(
                "flow {} -> {} already exists",
                key.local, key.guest
            ))));
            return;
        }
        let isn: u32 = rand::random();
        let mss = self.mss_for(&key);
        let flow = Flow {
            state: FlowState::SynSent,
            snd_nxt: isn.wrapping_add(1),
            snd_una: isn,
            rcv_nxt: 0,
            guest_window: 0,
            mss,
            out_queue: Vec::new(),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            rx_closed: false,
            to_pump: None,
            recv_buffered: Arc::new(AtomicUsize::new(0)),
            send_permits: Arc::new(Semaphore::new(SEND_QUEUE)),
            closed_tx: None,
            connect_reply: Some(reply),
            opened_at: Instant::now(),
        };
        self.emit(frames::tcp_segment(
            &TcpSegment {
                local: key.local,
                guest: key.guest,
                seq: isn,
                ack: None,
                window: RECV_WINDOW as u16,
                control: TcpControl::Syn,
                mss: Some(mss as u16),
            },
            &[],
        ));
        self.flows.insert(key, flow);
    }

    fn accept_parked(&mut self, key: FlowKey, reply: oneshot::Sender<Result<VtcpStream>>) {
        let Some(flow) = self.flows.get_mut(&key) else {
            let _ = reply.send(Err(Error::Stack("flow is gone".into())));
            return;
        };
        if flow.state != FlowState::SynParked {
            let _ = reply.send(Err(Error::Stack("flow already accepted".into())));
            return;
        }
        let isn: u32 = rand::random();
        let mss = flow.mss;
        flow.snd_una = isn;
        flow.snd_nxt = isn.wrapping_add(1);
        flow.state = FlowState::SynReceived;
        self.parked -= 1;
        let seg = TcpSegment {
            local: key.local,
            guest: key.guest,
            seq: isn,
            ack: Some(flow.rcv_nxt),
            window: flow.advertised_window(),
            control: TcpControl::Syn,
            mss: Some(mss as u16),
        };
        let stream = self.plumb(&key);
        let _ = reply.send(Ok(stream));
        self.emit(frames::tcp_segment(&seg, &[]));
    }

    /// Resolve the pending active open once established.
    fn finish_open(&mut self, key: &FlowKey) {
        let stream = self.plumb(key);
        if let Some(flow) = self.flows.get_mut(key) {
            if let Some(reply) = flow.connect_reply.take() {
                let _ = reply.send(Ok(stream));
            }
        }
    }

    /// Wire a flow to its pumps and hand back the application stream.
    fn plumb(&mut self, key: &FlowKey) -> VtcpStream {
        let flow = self.flows.get_mut(key).expect("plumbing a dead flow");
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel::<Delivery>();
        let (closed_tx, closed_rx) = watch::channel(false);
        flow.to_pump = Some(deliver_tx);
        flow.closed_tx = Some(closed_tx);

        let (app_io, engine_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (engine_read, engine_write) = tokio::io::split(engine_io);

        tokio::spawn(ingress_pump(
            deliver_rx,
            engine_write,
            flow.recv_buffered.clone(),
            closed_rx.clone(),
        ));
        tokio::spawn(egress_pump(
            engine_read,
            *key,
            self.cmd_tx.clone(),
            flow.send_permits.clone(),
            closed_rx,
        ));

        VtcpStream {
            io: app_io,
            local: key.local,
            peer: key.guest,
        }
    }

    /// Move queued bytes onto the wire within the guest's window, then FIN
    /// when the queue drains and the app has shut down.
    fn pump_out(&mut self, key: &FlowKey) {
        let Some(flow) = self.flows.get_mut(key) else {
            return;
        };
        if flow.state != FlowState::Established {
            return;
        }

        while !flow.out_queue.is_empty() {
            let window_room = flow.guest_window.saturating_sub(flow.inflight()) as usize;
            if window_room == 0 {
                break;
            }
            let take = flow.out_queue.len().min(flow.mss).min(window_room);
            let chunk: Vec<u8> = flow.out_queue.drain(..take).collect();
            let seg = TcpSegment {
                local: key.local,
                guest: key.guest,
                seq: flow.snd_nxt,
                ack: Some(flow.rcv_nxt),
                window: flow.advertised_window(),
                control: TcpControl::Psh,
                mss: None,
            };
            flow.snd_nxt = flow.snd_nxt.wrapping_add(take as u32);
            flow.send_permits.add_permits(take);
            let frame = frames::tcp_segment(&seg, &chunk);
            let _ = self.egress.send(frame);
        }

        if flow.fin_queued && !flow.fin_sent && flow.out_queue.is_empty() {
            let seg = TcpSegment {
                local: key.local,
                guest: key.guest,
                seq: flow.snd_nxt,
                ack: Some(flow.rcv_nxt),
                window: flow.advertised_window(),
                control: TcpControl::Fin,
                mss: None,
            };
            flow.snd_nxt = flow.snd_nxt.wrapping_add(1);
            flow.fin_sent = true;
            let frame = frames::tcp_segment(&seg, &[]);
            let _ = self.egress.send(frame);
        }
    }

    /// Drop flows that have fully closed in both directions.
    fn reap(&mut self, key: &FlowKey) {
        let done = self
            .flows
            .get(key)
            .map(|f| f.rx_closed && f.fin_sent && f.fin_acked)
            .unwrap_or(false);
        if done {
            if let Some(mut flow) = self.flows.remove(key) {
                trace!(?key, "flow closed");
                Self::teardown(&mut flow, false);
            }
        }
    }

    fn emit_ack(egress: &mpsc::UnboundedSender<Vec<u8>>, key: &FlowKey, flow: &Flow) {
        let _ = egress.send(frames::tcp_segment(
            &TcpSegment {
                local: key.local,
                guest: key.guest,
                seq: flow.snd_nxt,
                ack: Some(flow.rcv_nxt),
                window: flow.advertised_window(),
                control: TcpControl::None,
                mss: None,
            },
            &[],
        ));
    }

    fn teardown(flow: &mut Flow, reset: bool) {
        if reset {
            if let Some(tx) = &flow.to_pump {
                let _ = tx.send(Delivery::Rst);
            }
        }
        flow.to_pump = None;
        if let Some(closed) = flow.closed_tx.take() {
            let _ = closed.send(true);
        }
        if let Some(reply) = flow.connect_reply.take() {
            let _ = reply.send(Err(Error::Stack("connection reset".into())));
        }
        // Unblock any writer stuck on permits; the egress pump notices the
        // closed watch before forwarding more data.
        flow.send_permits.add_permits(SEND_QUEUE);
    }

    #[cfg(test)]
    fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

/// Guest → application: deliveries into the duplex pipe.
async fn ingress_pump(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut sink: tokio::io::WriteHalf<DuplexStream>,
    recv_buffered: Arc<AtomicUsize>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            delivery = deliveries.recv() => match delivery {
                Some(Delivery::Data(chunk)) => {
                    let len = chunk.len();
                    if sink.write_all(&chunk).await.is_err() {
                        // Application dropped its end.
                        recv_buffered.fetch_sub(len, Ordering::Relaxed);
                        break;
                    }
                    recv_buffered.fetch_sub(len, Ordering::Relaxed);
                }
                Some(Delivery::Fin) => {
                    let _ = sink.shutdown().await;
                    break;
                }
                Some(Delivery::Rst) | None => break,
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }
}

/// Application → guest: reads become engine writes, EOF becomes FIN,
/// errors become aborts.
async fn egress_pump(
    mut source: tokio::io::ReadHalf<DuplexStream>,
    key: FlowKey,
    cmd: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    mut closed: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = cmd.send(Command::Fin { key });
                    break;
                }
                Ok(n) => {
                    if *closed.borrow() {
                        break;
                    }
                    match permits.clone().acquire_many_owned(n as u32).await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                    if cmd.send(Command::Write { key, data: buf[..n].to_vec() }).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    let _ = cmd.send(Command::Abort { key });
                    break;
                }
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{IpAddress, TcpRepr, TcpSeqNumber};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_key() -> FlowKey {
        FlowKey {
            local: "93.184.216.34:443".parse().unwrap(),
            guest: SocketAddr::new(IpAddr::V4(super::super::GUEST4), 50000),
        }
    }

    fn dummy_syn_info() -> SynPacketInfo {
        SynPacketInfo::V4 {
            header: Ipv4Repr {
                src_addr: smoltcp::wire::Ipv4Address(super::super::GUEST4.octets()),
                dst_addr: smoltcp::wire::Ipv4Address(Ipv4Addr::new(93, 184, 216, 34).octets()),
                next_header: smoltcp::wire::IpProtocol::Tcp,
                payload_len: 20,
                hop_limit: 64,
            },
            data: [0u8; 8],
        }
    }

    /// Encode a guest segment good enough for `handle_segment`.
    fn segment(
        key: &FlowKey,
        seq: u32,
        ack: Option<u32>,
        control: TcpControl,
        payload: &[u8],
    ) -> Vec<u8> {
        let repr = TcpRepr {
            src_port: key.guest.port(),
            dst_port: key.local.port(),
            seq_number: TcpSeqNumber(seq as i32),
            ack_number: ack.map(|a| TcpSeqNumber(a as i32)),
            window_len: 64240,
            window_scale: None,
            control,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None; 3],
            payload,
        };
        let mut buf = vec![0u8; repr.header_len() + payload.len()];
        let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
        let (IpAddr::V4(guest_ip), IpAddr::V4(local_ip)) = (key.guest.ip(), key.local.ip())
        else {
            unreachable!()
        };
        repr.emit(
            &mut packet,
            &IpAddress::Ipv4(smoltcp::wire::Ipv4Address(guest_ip.octets())),
            &IpAddress::Ipv4(smoltcp::wire::Ipv4Address(local_ip.octets())),
            &ChecksumCapabilities::default(),
        );
        buf
    }

    fn parse_emitted(frame: &[u8]) -> (u32, u32, bool, bool, bool, Vec<u8>) {
        let eth = smoltcp::wire::EthernetFrame::new_checked(frame).unwrap();
        let ip = smoltcp::wire::Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        (
            tcp.seq_number().0 as u32,
            tcp.ack_number().0 as u32,
            tcp.syn(),
            tcp.rst(),
            tcp.fin(),
            tcp.payload().to_vec(),
        )
    }

    struct Harness {
        engine: Engine,
        egress_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    }

    fn harness() -> Harness {
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Harness {
            engine: Engine::new(egress_tx, cmd_tx.clone(), 1500),
            egress_rx,
            cmd_rx,
            cmd_tx,
        }
    }

    impl Harness {
        fn feed(&mut self, raw: &[u8]) -> Option<ConnectRequest> {
            let packet = TcpPacket::new_checked(raw).unwrap();
            let mut parked = None;
            self.engine
                .handle_segment(test_key(), &packet, dummy_syn_info(), &mut |req| {
                    parked = Some(req);
                });
            parked
        }

        fn drain_commands(&mut self) {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.engine.handle_command(cmd);
            }
        }
    }

    #[tokio::test]
    async fn syn_parks_until_accept_then_syn_ack() {
        let mut h = harness();
        let key = test_key();

        let req = h.feed(&segment(&key, 1000, None, TcpControl::Syn, &[]));
        let req = req.expect("syn should park");
        assert_eq!(h.engine.parked(), 1);
        // Nothing emitted while parked.
        assert!(h.egress_rx.try_recv().is_err());

        let accept = tokio::spawn(req.accept());
        tokio::task::yield_now().await;
        h.drain_commands();

        let frame = h.egress_rx.try_recv().expect("syn-ack emitted");
        let (_seq, ack, syn, rst, _fin, _payload) = parse_emitted(&frame);
        assert!(syn && !rst);
        assert_eq!(ack, 1001);
        assert_eq!(h.engine.parked(), 0);

        let stream = accept.await.unwrap().expect("stream");
        assert_eq!(stream.peer_addr(), key.guest);
    }

    #[tokio::test]
    async fn refuse_answers_rst_and_forgets_the_flow() {
        let mut h = harness();
        let key = test_key();

        let req = h.feed(&segment(&key, 2000, None, TcpControl::Syn, &[])).unwrap();
        req.refuse();
        h.drain_commands();

        let frame = h.egress_rx.try_recv().expect("rst emitted");
        let (_seq, ack, syn, rst, _fin, _payload) = parse_emitted(&frame);
        assert!(rst && !syn);
        assert_eq!(ack, 2001);
        assert_eq!(h.engine.flow_count(), 0);
        assert_eq!(h.engine.parked(), 0);
    }

    #[tokio::test]
    async fn dropped_request_abandons_silently() {
        let mut h = harness();
        let key = test_key();

        let req = h.feed(&segment(&key, 3000, None, TcpControl::Syn, &[])).unwrap();
        drop(req);
        h.drain_commands();

        assert!(h.egress_rx.try_recv().is_err());
        assert_eq!(h.engine.flow_count(), 0);
    }

    #[tokio::test]
    async fn data_flows_and_half_close_completes() {
        let mut h = harness();
        let key = test_key();

        let req = h.feed(&segment(&key, 1000, None, TcpControl::Syn, &[])).unwrap();
        let accept = tokio::spawn(req.accept());
        tokio::task::yield_now().await;
        h.drain_commands();
        let syn_ack_frame = h.egress_rx.try_recv().unwrap();
        let (isn, _, _, _, _, _) = parse_emitted(&syn_ack_frame);
        let mut stream = accept.await.unwrap().unwrap();

        // Handshake ACK, then 4 bytes of data.
        h.feed(&segment(&key, 1001, Some(isn.wrapping_add(1)), TcpControl::None, &[]));
        h.feed(&segment(&key, 1001, Some(isn.wrapping_add(1)), TcpControl::Psh, b"ping"));

        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        // Application answers and closes its write half.
        stream.write_all(b"pong").await.unwrap();
        stream.shutdown().await.unwrap();
        // Give the egress pump a moment, then run its commands.
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.drain_commands();

        // Expect the ack of "ping", then the data, then the FIN.
        let mut saw_data = false;
        let mut fin_seq = None;
        while let Ok(frame) = h.egress_rx.try_recv() {
            let (seq, _ack, _syn, _rst, fin, payload) = parse_emitted(&frame);
            if payload == b"pong" {
                saw_data = true;
            }
            if fin {
                fin_seq = Some(seq);
            }
        }
        assert!(saw_data, "pong segment never emitted");
        let fin_seq = fin_seq.expect("fin never emitted");

        // Guest acks the FIN and sends its own.
        h.feed(&segment(&key, 1005, Some(fin_seq.wrapping_add(1)), TcpControl::Fin, &[]));
        h.drain_commands();
        assert_eq!(h.engine.flow_count(), 0, "flow should reap after both FINs");
    }

    #[tokio::test]
    async fn stray_segment_gets_rst() {
        let mut h = harness();
        let key = test_key();

        h.feed(&segment(&key, 7000, Some(1), TcpControl::None, b"stray"));
        let frame = h.egress_rx.try_recv().expect("rst for stray segment");
        let (_, _, _, rst, _, _) = parse_emitted(&frame);
        assert!(rst);
    }

    #[tokio::test]
    async fn active_open_completes_on_syn_ack() {
        let mut h = harness();
        let key = test_key();

        let (reply_tx, reply_rx) = oneshot::channel();
        h.engine.handle_command(Command::Connect {
            key,
            reply: reply_tx,
        });
        let frame = h.egress_rx.try_recv().expect("syn emitted");
        let (isn, _ack, syn, _rst, _fin, _) = parse_emitted(&frame);
        assert!(syn);

        // Guest answers SYN-ACK.
        let syn_ack = {
            let repr = TcpRepr {
                src_port: key.guest.port(),
                dst_port: key.local.port(),
                seq_number: TcpSeqNumber(9000),
                ack_number: Some(TcpSeqNumber(isn.wrapping_add(1) as i32)),
                window_len: 64240,
                window_scale: None,
                control: TcpControl::Syn,
                max_seg_size: Some(1460),
                sack_permitted: false,
                sack_ranges: [None; 3],
                payload: &[],
            };
            let mut buf = vec![0u8; repr.header_len()];
            let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
            let (IpAddr::V4(guest_ip), IpAddr::V4(local_ip)) = (key.guest.ip(), key.local.ip())
            else {
                unreachable!()
            };
            repr.emit(
                &mut packet,
                &IpAddress::Ipv4(smoltcp::wire::Ipv4Address(guest_ip.octets())),
                &IpAddress::Ipv4(smoltcp::wire::Ipv4Address(local_ip.octets())),
                &ChecksumCapabilities::default(),
            );
            buf
        };
        h.feed(&syn_ack);

        let stream = reply_rx.await.unwrap().expect("connected");
        assert_eq!(stream.local_addr(), key.local);

        // The handshake-completing ACK went out.
        let frame = h.egress_rx.try_recv().expect("ack emitted");
        let (_, ack, syn, _, _, _) = parse_emitted(&frame);
        assert!(!syn);
        assert_eq!(ack, 9001);
    }
}
