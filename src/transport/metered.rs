//! Byte-metering socket shim for inbound connections.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::SocketStream;

/// Shared counters for a metered socket.
#[derive(Clone, Debug, Default)]
pub struct MeterHandle {
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl MeterHandle {
    /// Total bytes read from the socket so far.
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Total bytes written to the socket so far.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Wraps a socket and counts the bytes flowing through it.
///
/// The accept loop installs this shim under the transport so that a
/// connection's traffic can be reported when it closes.
pub struct MeteredStream<S> {
    inner: S,
    meter: MeterHandle,
}

impl<S: SocketStream> MeteredStream<S> {
    pub fn new(inner: S) -> (Self, MeterHandle) {
        let meter = MeterHandle::default();
        (
            Self {
                inner,
                meter: meter.clone(),
            },
            meter,
        )
    }
}

impl<S: SocketStream> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            self.meter.read.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

impl<S: SocketStream> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.meter.written.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_meter_counts_both_directions() {
        let (a, b) = tokio::io::duplex(256);
        let (mut metered, meter) = MeteredStream::new(a);
        let mut other = b;

        metered.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        other.read_exact(&mut buf).await.unwrap();

        other.write_all(b"hi").await.unwrap();
        let mut buf2 = [0u8; 2];
        metered.read_exact(&mut buf2).await.unwrap();

        assert_eq!(meter.bytes_written(), 5);
        assert_eq!(meter.bytes_read(), 2);
    }
}
