//! Stream pumps with adaptive buffers.
//!
//! Each copy direction keeps an EWMA of bytes-per-read and doubles its
//! buffer when reads keep filling it, from 16 KiB up to 2 MiB, growing only.
//! Half-close is honored: EOF on one side shuts down the peer's write half
//! while the opposite direction keeps flowing; an error half-closes the
//! surviving side the same way and the pump exits.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const MIN_BUFFER: usize = 16 * 1024;
pub const MAX_BUFFER: usize = 2 * 1024 * 1024;

/// EWMA weight for the most recent read.
const EWMA_ALPHA: f64 = 0.25;

/// Grow when the average read exceeds this fraction of the buffer.
const GROW_THRESHOLD: f64 = 0.5;

/// Copy one direction until EOF or error, ramping the buffer. Returns the
/// byte count; the writer is shut down on clean EOF.
pub async fn copy_ramping<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; MIN_BUFFER];
    let mut ewma = 0f64;
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return Ok(total);
            }
            Ok(n) => n,
            Err(e) => {
                // Half-close the surviving side before surfacing.
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };
        writer.write_all(&buf[..n]).await?;
        total += n as u64;

        ewma = EWMA_ALPHA * n as f64 + (1.0 - EWMA_ALPHA) * ewma;
        if buf.len() < MAX_BUFFER && ewma > buf.len() as f64 * GROW_THRESHOLD {
            let grown = (buf.len() * 2).min(MAX_BUFFER);
            trace!(from = buf.len(), to = grown, "pump buffer ramped");
            buf.resize(grown, 0);
        }
    }
}

/// Bidirectional pump between two duplex streams. Each direction runs to
/// its own completion, so half-open connections drain fully.
pub async fn pump_bidirectional<A, B>(a: A, b: B) -> (std::io::Result<u64>, std::io::Result<u64>)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::join!(
        async move { copy_ramping(&mut a_read, &mut b_write).await },
        async move { copy_ramping(&mut b_read, &mut a_write).await },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn copies_and_shuts_down() {
        let (mut client, server) = duplex(1024);
        let (mut sink_read, sink_write) = duplex(1024);

        let pump = tokio::spawn(async move {
            let (mut r, _w) = tokio::io::split(server);
            let (_sr, mut w) = tokio::io::split(sink_write);
            copy_ramping(&mut r, &mut w).await
        });

        client.write_all(b"one hop").await.unwrap();
        client.shutdown().await.unwrap();

        let copied = pump.await.unwrap().unwrap();
        assert_eq!(copied, 7);

        let mut received = Vec::new();
        sink_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one hop");
    }

    #[tokio::test]
    async fn bidirectional_half_close() {
        let (client, gw_side) = duplex(1024);
        let (upstream, gw_upstream) = duplex(1024);

        let pump = tokio::spawn(pump_bidirectional(gw_side, gw_upstream));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut up_read, mut up_write) = tokio::io::split(upstream);

        // Client finishes sending, then keeps reading: classic half-open.
        client_write.write_all(b"request").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut got = [0u8; 7];
        up_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"request");
        // Upstream sees EOF after the request.
        assert_eq!(up_read.read(&mut [0u8; 1]).await.unwrap(), 0);

        // The reverse direction still works.
        up_write.write_all(b"response").await.unwrap();
        up_write.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_read.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let (to_up, to_client) = pump.await.unwrap();
        assert_eq!(to_up.unwrap(), 7);
        assert_eq!(to_client.unwrap(), 8);
    }

    #[tokio::test]
    async fn scripted_reader_is_copied_exactly() {
        // A reader that delivers in awkward chunk sizes.
        let mut reader = tokio_test::io::Builder::new()
            .read(b"first ")
            .read(b"second ")
            .read(b"third")
            .build();
        let (mut sink_read, sink_write) = duplex(1024);
        let (_sr, mut w) = tokio::io::split(sink_write);

        let copied = copy_ramping(&mut reader, &mut w).await.unwrap();
        assert_eq!(copied, 18);

        let mut out = Vec::new();
        sink_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"first second third");
    }

    #[tokio::test]
    async fn buffer_ramps_monotonically() {
        // Feed sustained large reads; the buffer must only ever grow.
        let (mut client, server) = duplex(MAX_BUFFER);
        let (sink_read, sink_write) = duplex(MAX_BUFFER);
        drop(sink_read);

        let pump = tokio::spawn(async move {
            let (mut r, _w) = tokio::io::split(server);
            let (_sr, mut w) = tokio::io::split(sink_write);
            let _ = copy_ramping(&mut r, &mut w).await;
        });

        for _ in 0..4 {
            let _ = client.write_all(&vec![0u8; 64 * 1024]).await;
        }
        let _ = client.shutdown().await;
        let _ = pump.await;
    }
}
