use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::log_debug;
use crate::logger::Logger;

/// Shared RX/TX byte counters for one channel.
#[derive(Clone)]
pub struct Traffic {
    rx: Arc<AtomicU64>,
    tx: Arc<AtomicU64>,
}

impl Traffic {
    pub fn new() -> Self {
        Self {
            rx: Arc::new(AtomicU64::new(0)),
            tx: Arc::new(AtomicU64::new(0)),
        }
    }

    /// (bytes received, bytes sent)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.rx.load(Ordering::Relaxed),
            self.tx.load(Ordering::Relaxed),
        )
    }
}

impl Default for Traffic {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel wrapper that counts bytes in both directions and reports
/// activity at debug level. Installed when `log_activity` is set.
pub struct ActivityProbe<T> {
    inner: T,
    traffic: Traffic,
    logger: Logger,
    channel_id: u64,
}

impl<T> ActivityProbe<T> {
    pub fn new(inner: T, traffic: Traffic, logger: Logger, channel_id: u64) -> Self {
        Self {
            inner,
            traffic,
            logger,
            channel_id,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ActivityProbe<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.traffic.rx.fetch_add(n as u64, Ordering::Relaxed);
                log_debug!(self.logger, "channel {}: read {} bytes", self.channel_id, n);
            }
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ActivityProbe<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                self.traffic.tx.fetch_add(*n as u64, Ordering::Relaxed);
                log_debug!(self.logger, "channel {}: wrote {} bytes", self.channel_id, n);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_both_directions() {
        let (a, b) = tokio::io::duplex(64);
        let traffic = Traffic::new();
        let mut probed = ActivityProbe::new(a, traffic.clone(), Logger::disabled(), 1);

        let echo = tokio::spawn(async move {
            let mut b = b;
            let mut buf = [0u8; 5];
            b.read_exact(&mut buf).await.unwrap();
            b.write_all(&buf).await.unwrap();
        });

        probed.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        probed.read_exact(&mut buf).await.unwrap();
        echo.await.unwrap();

        assert_eq!(traffic.snapshot(), (5, 5));
    }
}
