//! Best-effort writing with a save queue
//!
//! [`QueuedWriter`] wraps an `AsyncWrite` and makes the backpressure edge
//! explicit. A write first attempts to push the whole buffer through the
//! sink without blocking; whatever the sink does not accept synchronously
//! is parked in a FIFO queue as `(bytes, written-prefix)` pairs. The owner
//! later drains the queue with a real waker and learns exactly when the
//! sink caught up, which is the moment to lift suspension.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::io::AsyncWrite;

/// Result of a best-effort write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every byte was accepted synchronously
    Complete,
    /// Some suffix was parked in the save queue
    Queued,
}

/// One parked buffer and how much of it already reached the sink
#[derive(Debug)]
struct PendingWrite {
    bytes: Bytes,
    written: usize,
}

/// An `AsyncWrite` with an explicit save queue
#[derive(Debug)]
pub struct QueuedWriter<W> {
    writer: W,
    queue: VecDeque<PendingWrite>,
    queued_bytes: usize,
}

impl<W: AsyncWrite + Unpin> QueuedWriter<W> {
    /// Wrap a sink
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    /// Whether the save queue is empty
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of bytes parked in the save queue
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Drop everything parked in the save queue
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
    }

    /// Park a buffer at the back of the save queue without attempting
    /// a write
    pub fn enqueue(&mut self, bytes: Bytes) {
        self.queued_bytes += bytes.len();
        self.queue.push_back(PendingWrite { bytes, written: 0 });
    }

    /// Write a buffer, parking whatever the sink does not accept
    ///
    /// If the queue is already non-empty the buffer is parked directly;
    /// writing it ahead of queued data would reorder the stream.
    ///
    /// # Errors
    ///
    /// Returns the sink's error; the caller decides whether that is fatal
    /// to the flow or to the whole tunnel.
    pub fn write_or_queue(&mut self, bytes: Bytes) -> io::Result<WriteOutcome> {
        if !self.queue.is_empty() {
            self.enqueue(bytes);
            return Ok(WriteOutcome::Queued);
        }

        let mut cx = Context::from_waker(Waker::noop());
        let mut written = 0;
        while written < bytes.len() {
            match Pin::new(&mut self.writer).poll_write(&mut cx, &bytes[written..]) {
                Poll::Ready(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "sink accepted zero bytes",
                    ));
                }
                Poll::Ready(Ok(n)) => written += n,
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {
                    self.queued_bytes += bytes.len() - written;
                    self.queue.push_back(PendingWrite { bytes, written });
                    return Ok(WriteOutcome::Queued);
                }
            }
        }
        Ok(WriteOutcome::Complete)
    }

    /// Drive the save queue toward the sink
    ///
    /// Resolves `Ready(Ok(()))` once the queue is empty; `Pending` means
    /// the waker fires when the sink accepts more.
    pub fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let Some(front) = self.queue.front_mut() {
            match Pin::new(&mut self.writer).poll_write(cx, &front.bytes[front.written..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "sink accepted zero bytes",
                    )));
                }
                Poll::Ready(Ok(n)) => {
                    front.written += n;
                    self.queued_bytes -= n;
                    if front.written == front.bytes.len() {
                        self.queue.pop_front();
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Drain the save queue completely
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn drain(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_drain(cx)).await
    }

    /// Access the wrapped sink (for shutdown)
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_fits_in_buffer() {
        let (tx, _rx) = tokio::io::duplex(64);
        let mut sink = QueuedWriter::new(tx);
        let outcome = sink.write_or_queue(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(outcome, WriteOutcome::Complete);
        assert!(sink.is_idle());
        assert_eq!(sink.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_write_overflow_queues_suffix() {
        let (tx, _rx) = tokio::io::duplex(16);
        let mut sink = QueuedWriter::new(tx);
        let outcome = sink.write_or_queue(Bytes::from(vec![0xAB; 40])).unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert!(!sink.is_idle());
        assert_eq!(sink.queued_bytes(), 40 - 16);
    }

    #[tokio::test]
    async fn test_queue_preserves_order_after_overflow() {
        let (tx, mut rx) = tokio::io::duplex(8);
        let mut sink = QueuedWriter::new(tx);

        assert_eq!(
            sink.write_or_queue(Bytes::from(vec![1u8; 12])).unwrap(),
            WriteOutcome::Queued
        );
        // queue non-empty: later writes must be parked, not written
        assert_eq!(
            sink.write_or_queue(Bytes::from(vec![2u8; 4])).unwrap(),
            WriteOutcome::Queued
        );

        let reader = tokio::spawn(async move {
            let mut all = Vec::new();
            let mut buf = [0u8; 64];
            while all.len() < 16 {
                let n = rx.read(&mut buf).await.unwrap();
                all.extend_from_slice(&buf[..n]);
            }
            all
        });

        sink.drain().await.unwrap();
        assert!(sink.is_idle());
        assert_eq!(sink.queued_bytes(), 0);

        let all = reader.await.unwrap();
        assert_eq!(&all[..12], &[1u8; 12][..]);
        assert_eq!(&all[12..], &[2u8; 4][..]);
    }

    #[tokio::test]
    async fn test_clear_discards_queued_bytes() {
        let (tx, _rx) = tokio::io::duplex(4);
        let mut sink = QueuedWriter::new(tx);
        sink.write_or_queue(Bytes::from(vec![0u8; 32])).unwrap();
        assert!(!sink.is_idle());
        sink.clear();
        assert!(sink.is_idle());
        assert_eq!(sink.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_write_error_surfaces() {
        let (tx, rx) = tokio::io::duplex(4);
        drop(rx);
        let mut sink = QueuedWriter::new(tx);
        let result = sink.write_or_queue(Bytes::from_static(b"data"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_through_get_mut() {
        let (tx, mut rx) = tokio::io::duplex(64);
        let mut sink = QueuedWriter::new(tx);
        sink.write_or_queue(Bytes::from_static(b"bye")).unwrap();
        sink.get_mut().shutdown().await.unwrap();

        let mut buf = Vec::new();
        rx.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}
