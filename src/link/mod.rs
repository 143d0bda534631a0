//! Link endpoint: framed Ethernet over the hypervisor boundary.
//!
//! Two backends carry guest Ethernet frames:
//! - a connected datagram socket pair, one frame per datagram (preferred);
//! - a byte stream with a 16-bit little-endian length prefix per frame
//!   (QEMU-style).
//!
//! The endpoint reads one frame at a time, writes batches best-effort, and
//! reports capabilities the stack uses to skip checksum verification on
//! ingress. Socket buffers are enlarged on both ends to ride out bursts.

pub mod sniffer;

use std::sync::Arc;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixDatagram, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{Error, Result};

/// Standard Ethernet MTU.
pub const MTU_STANDARD: usize = 1500;

/// Jumbo MTU used when the hypervisor negotiates large frames.
pub const MTU_JUMBO: usize = 65520;

/// Ethernet header length.
pub const ETH_HEADER_LEN: usize = 14;

/// Buffer size we ask the OS for on both ends of the pair. The OS may clamp.
const SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// What the link hardware-equivalent does for the stack.
#[derive(Debug, Clone, Copy)]
pub struct LinkCapabilities {
    /// Inbound frames arrive checksum-valid; the stack need not verify.
    pub rx_checksum_offload: bool,
    /// The link accepts frames without checksums filled in.
    /// (We always emit full checksums, so this stays false.)
    pub tx_checksum_offload: bool,
    /// The guest resolves the gateway with ARP/ND; the stack must answer.
    pub resolves_addresses: bool,
}

impl Default for LinkCapabilities {
    fn default() -> Self {
        Self {
            rx_checksum_offload: true,
            tx_checksum_offload: false,
            resolves_addresses: true,
        }
    }
}

/// A frame-at-a-time Ethernet endpoint.
#[async_trait]
pub trait Link: Send + Sync {
    /// Receive exactly one Ethernet frame into `buf`, returning its length.
    /// Frames longer than `mtu() + ETH_HEADER_LEN` are dropped internally.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send one Ethernet frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Best-effort sequential batch write. Returns the count written and
    /// the first error, if any.
    async fn send_batch(&self, frames: &[Vec<u8>]) -> (usize, Option<Error>) {
        for (i, frame) in frames.iter().enumerate() {
            if let Err(e) = self.send(frame).await {
                return (i, Some(e));
            }
        }
        (frames.len(), None)
    }

    fn mtu(&self) -> usize;

    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities::default()
    }
}

/// Largest frame this link accepts, header included.
fn max_frame_len(mtu: usize) -> usize {
    mtu + ETH_HEADER_LEN
}

fn enlarge_buffers(sock: SockRef<'_>) {
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "could not enlarge receive buffer");
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "could not enlarge send buffer");
    }
}

// ---------------------------------------------------------------------------
// Datagram backend
// ---------------------------------------------------------------------------

/// Connected datagram socket pair: each datagram is exactly one frame.
pub struct DatagramLink {
    socket: UnixDatagram,
    write_lock: Mutex<()>,
    mtu: usize,
}

impl DatagramLink {
    pub fn new(socket: UnixDatagram, mtu: usize) -> Result<Self> {
        debug_assert!(mtu == MTU_STANDARD || mtu == MTU_JUMBO);
        enlarge_buffers(SockRef::from(&socket));
        Ok(Self {
            socket,
            write_lock: Mutex::new(()),
            mtu,
        })
    }
}

#[async_trait]
impl Link for DatagramLink {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let n = self.socket.recv(buf).await?;
            if n < ETH_HEADER_LEN {
                trace!(len = n, "runt frame dropped");
                continue;
            }
            if n > max_frame_len(self.mtu) {
                trace!(len = n, mtu = self.mtu, "oversized frame dropped");
                continue;
            }
            return Ok(n);
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > max_frame_len(self.mtu) {
            return Err(Error::Link(format!(
                "frame of {} bytes exceeds mtu {}",
                frame.len(),
                self.mtu
            )));
        }
        let _guard = self.write_lock.lock().await;
        self.socket.send(frame).await?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

// ---------------------------------------------------------------------------
// Stream backend
// ---------------------------------------------------------------------------

/// Length-prefixed stream: `u16` little-endian frame size, then the frame.
pub struct StreamLink {
    reader: Mutex<tokio::io::ReadHalf<UnixStream>>,
    writer: Mutex<tokio::io::WriteHalf<UnixStream>>,
    mtu: usize,
}

impl StreamLink {
    pub fn new(stream: UnixStream, mtu: usize) -> Result<Self> {
        debug_assert!(mtu == MTU_STANDARD || mtu == MTU_JUMBO);
        enlarge_buffers(SockRef::from(&stream));
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            mtu,
        })
    }
}

#[async_trait]
impl Link for StreamLink {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut prefix = [0u8; 2];
            reader.read_exact(&mut prefix).await?;
            let len = u16::from_le_bytes(prefix) as usize;
            if len < ETH_HEADER_LEN || len > max_frame_len(self.mtu) {
                // Consume and drop; the stream stays aligned either way.
                let mut sink = vec![0u8; len];
                reader.read_exact(&mut sink).await?;
                trace!(len, mtu = self.mtu, "bad-length frame dropped");
                continue;
            }
            reader.read_exact(&mut buf[..len]).await?;
            return Ok(len);
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let wire = gateway_protocol::framing::emit(frame)?;
        if frame.len() > max_frame_len(self.mtu) {
            return Err(Error::Link(format!(
                "frame of {} bytes exceeds mtu {}",
                frame.len(),
                self.mtu
            )));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&wire).await?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

// ---------------------------------------------------------------------------
// Sniffing wrapper
// ---------------------------------------------------------------------------

/// Wrap a link so every frame in both directions lands in a pcap file.
pub struct SniffingLink {
    inner: Arc<dyn Link>,
    sniffer: sniffer::PcapWriter,
}

impl SniffingLink {
    pub fn new(inner: Arc<dyn Link>, sniffer: sniffer::PcapWriter) -> Self {
        Self { inner, sniffer }
    }
}

#[async_trait]
impl Link for SniffingLink {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.recv(buf).await?;
        if let Err(e) = self.sniffer.record(&buf[..n]) {
            warn!(error = %e, "pcap write failed");
        }
        Ok(n)
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        if let Err(e) = self.sniffer.record(frame) {
            warn!(error = %e, "pcap write failed");
        }
        self.inner.send(frame).await
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    fn capabilities(&self) -> LinkCapabilities {
        self.inner.capabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagram_round_trip() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let link_a = DatagramLink::new(a, MTU_STANDARD).unwrap();
        let link_b = DatagramLink::new(b, MTU_STANDARD).unwrap();

        let frame = vec![0xEEu8; 64];
        link_a.send(&frame).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let n = link_b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &frame[..]);
    }

    #[tokio::test]
    async fn datagram_rejects_oversized_send() {
        let (a, _b) = UnixDatagram::pair().unwrap();
        let link = DatagramLink::new(a, MTU_STANDARD).unwrap();
        let frame = vec![0u8; MTU_STANDARD + ETH_HEADER_LEN + 1];
        assert!(link.send(&frame).await.is_err());
    }

    #[tokio::test]
    async fn datagram_drops_oversized_recv() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let link_b = DatagramLink::new(b, MTU_STANDARD).unwrap();

        // One byte over the limit, then a valid frame; only the second
        // should surface.
        a.send(&vec![1u8; MTU_STANDARD + ETH_HEADER_LEN + 1])
            .await
            .unwrap();
        let good = vec![2u8; MTU_STANDARD + ETH_HEADER_LEN];
        a.send(&good).await.unwrap();

        let mut buf = vec![0u8; MTU_JUMBO + ETH_HEADER_LEN];
        let n = link_b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &good[..]);
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let link_a = StreamLink::new(a, MTU_STANDARD).unwrap();
        let link_b = StreamLink::new(b, MTU_STANDARD).unwrap();

        let first = vec![0x11u8; 60];
        let second = vec![0x22u8; 1514];
        link_a.send(&first).await.unwrap();
        link_a.send(&second).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let n = link_b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &first[..]);
        let n = link_b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &second[..]);
    }

    #[tokio::test]
    async fn batch_reports_count_and_first_error() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let link = DatagramLink::new(a, MTU_STANDARD).unwrap();
        drop(b);

        let frames = vec![vec![0u8; 64], vec![0u8; MTU_JUMBO]];
        let (written, err) = link.send_batch(&frames).await;
        // Second frame exceeds the MTU; the first may or may not hit EPIPE
        // depending on platform, so only assert the error position bound.
        assert!(written <= 1);
        assert!(err.is_some());
    }
}
