//! Stream adapters layered around message bodies.
//!
//! Failures are reported as `io::Error`s wrapping a [`TransportError`], which
//! [`TransportError::from_io`] unwraps again on the way out.

use crate::error::TransportError;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};

pin_project! {
    /// Fails once more than `limit` bytes have been read.
    #[derive(Debug)]
    pub struct MaxMessageSizeStream<R> {
        #[pin]
        inner: R,
        read: u64,
        limit: u64,
    }
}

impl<R> MaxMessageSizeStream<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self { inner, read: 0, limit }
    }
}

impl<R: AsyncRead> AsyncRead for MaxMessageSizeStream<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;

        *this.read += (buf.filled().len() - before) as u64;
        if *this.read > *this.limit {
            return Poll::Ready(Err(TransportError::quota_exceeded(*this.limit).into()));
        }
        Poll::Ready(Ok(()))
    }
}

pin_project! {
    /// Fails a read that stays pending for longer than `timeout`.
    #[derive(Debug)]
    pub struct TimeoutStream<R> {
        #[pin]
        inner: R,
        #[pin]
        sleep: Sleep,
        timeout: Duration,
        operation: &'static str,
        armed: bool,
    }
}

impl<R> TimeoutStream<R> {
    /// Must be called from within a tokio runtime.
    pub fn new(inner: R, timeout: Duration, operation: &'static str) -> Self {
        Self { inner, sleep: tokio::time::sleep(timeout), timeout, operation, armed: false }
    }
}

impl<R: AsyncRead> AsyncRead for TimeoutStream<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if let Poll::Ready(result) = this.inner.poll_read(cx, buf) {
            *this.armed = false;
            return Poll::Ready(result);
        }

        if !*this.armed {
            this.sleep.as_mut().reset(Instant::now() + *this.timeout);
            *this.armed = true;
        }

        ready!(this.sleep.poll(cx));
        *this.armed = false;
        Poll::Ready(Err(TransportError::timeout(*this.operation, *this.timeout).into()))
    }
}

/// Observes the end of a request body read by somebody else.
#[derive(Debug, Clone, Default)]
pub struct EofSignal {
    inner: Arc<EofInner>,
}

#[derive(Debug, Default)]
struct EofInner {
    reached: AtomicBool,
    notify: Notify,
}

impl EofSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reached(&self) -> bool {
        self.inner.reached.load(Ordering::Acquire)
    }

    pub(crate) fn mark(&self) {
        if !self.inner.reached.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Waits until the wrapped stream reported end of file.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_reached() {
                return;
            }
            notified.await;
        }
    }
}

pin_project! {
    /// Signals an [`EofSignal`] once the inner stream returns end of file.
    #[derive(Debug)]
    pub struct EofDetectingStream<R> {
        #[pin]
        inner: R,
        signal: EofSignal,
    }
}

impl<R> EofDetectingStream<R> {
    pub fn new(inner: R, signal: EofSignal) -> Self {
        Self { inner, signal }
    }
}

impl<R: AsyncRead> AsyncRead for EofDetectingStream<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;

        if buf.filled().len() == before && buf.remaining() > 0 {
            this.signal.mark();
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn size_limit_is_enforced() {
        let mut stream = MaxMessageSizeStream::new(&b"0123456789"[..], 9);
        let mut out = Vec::new();
        let error = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(TransportError::from_io(error), TransportError::QuotaExceeded { limit: 9 }));

        let mut stream = MaxMessageSizeStream::new(&b"0123456789"[..], 10);
        let mut out = Vec::new();
        assert_eq!(stream.read_to_end(&mut out).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn pending_read_times_out() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut stream = Box::pin(TimeoutStream::new(reader, Duration::from_millis(20), "receive"));
        let mut buf = [0u8; 8];
        let error = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(TransportError::from_io(error), TransportError::Timeout { operation: "receive", .. }));
    }

    #[tokio::test]
    async fn eof_is_signalled() {
        let signal = EofSignal::new();
        let mut stream = EofDetectingStream::new(&b"abc"[..], signal.clone());
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(signal.is_reached());
        waiter.await.unwrap();
    }
}
