//! Message scoped byte streams over a [`WebSocket`].

use crate::error::TransportError;
use crate::sync::AtomicTransition;
use crate::websocket::{CloseStatus, ReceivedFrame, WebSocket, WebSocketMessageType};
use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

/// Reads the rest of one websocket message.
///
/// Starts with the bytes already received before the stream was handed to a decoder and falls
/// back to socket reads until the end of the message. The source that created the stream waits
/// for it to be released (dropped or drained) before it receives the next message; a stream
/// dropped mid-message drains the remainder in the background so the next read starts on a
/// message boundary.
pub struct WebSocketStream {
    socket: Arc<dyn WebSocket>,
    message_type: WebSocketMessageType,
    look_ahead: Bytes,
    end_of_message: bool,
    chunk_size: usize,
    drain_limit: u64,
    pending: Option<BoxFuture<'static, io::Result<ReceivedFrame>>>,
    input_close_status: Arc<OnceLock<CloseStatus>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for WebSocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketStream")
            .field("message_type", &self.message_type)
            .field("look_ahead", &self.look_ahead.len())
            .field("end_of_message", &self.end_of_message)
            .finish_non_exhaustive()
    }
}

impl WebSocketStream {
    pub(crate) fn new(
        socket: Arc<dyn WebSocket>,
        first: ReceivedFrame,
        chunk_size: usize,
        drain_limit: u64,
        input_close_status: Arc<OnceLock<CloseStatus>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            socket,
            message_type: first.message_type,
            look_ahead: first.data,
            end_of_message: first.end_of_message,
            chunk_size: chunk_size.max(1),
            drain_limit,
            pending: None,
            input_close_status,
            permit: Some(permit),
        }
    }

    pub fn message_type(&self) -> WebSocketMessageType {
        self.message_type
    }

    pub fn is_end_of_message(&self) -> bool {
        self.end_of_message && self.look_ahead.is_empty()
    }

    /// Consumes the rest of the current message and releases the stream.
    pub async fn drain(&mut self) -> Result<(), TransportError> {
        let pending = self.pending.take();
        let result = if self.end_of_message {
            Ok(())
        } else {
            drain_socket(
                Arc::clone(&self.socket),
                pending,
                self.chunk_size,
                self.drain_limit,
                Arc::clone(&self.input_close_status),
            )
            .await
        };
        self.end_of_message = true;
        self.look_ahead.clear();
        self.permit.take();
        result
    }

    fn on_frame(&mut self, frame: ReceivedFrame) -> io::Result<()> {
        if frame.message_type == WebSocketMessageType::Close {
            if let Some(status) = frame.close_status {
                let _ = self.input_close_status.set(status);
            }
            self.end_of_message = true;
            self.permit.take();
            return Err(TransportError::protocol(
                http::StatusCode::BAD_REQUEST,
                "close frame received in the middle of a message",
            )
            .into());
        }

        self.end_of_message = frame.end_of_message;
        self.look_ahead = frame.data;
        Ok(())
    }
}

impl AsyncRead for WebSocketStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.look_ahead.is_empty() {
                let len = this.look_ahead.len().min(buf.remaining());
                buf.put_slice(&this.look_ahead[..len]);
                this.look_ahead.advance(len);
                return Poll::Ready(Ok(()));
            }

            if this.end_of_message {
                this.permit.take();
                return Poll::Ready(Ok(()));
            }

            let pending = match this.pending.as_mut() {
                Some(pending) => pending,
                None => {
                    let socket = Arc::clone(&this.socket);
                    let chunk_size = this.chunk_size;
                    this.pending.insert(Box::pin(async move { socket.receive(chunk_size).await }))
                }
            };

            let result = ready!(pending.as_mut().poll(cx));
            this.pending = None;
            this.on_frame(result?)?;
        }
    }
}

impl Drop for WebSocketStream {
    fn drop(&mut self) {
        if self.end_of_message || self.permit.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.socket.abort();
            return;
        };

        let socket = Arc::clone(&self.socket);
        let pending = self.pending.take();
        let chunk_size = self.chunk_size;
        let drain_limit = self.drain_limit;
        let input_close_status = Arc::clone(&self.input_close_status);
        let permit = self.permit.take();

        handle.spawn(async move {
            if let Err(e) = drain_socket(Arc::clone(&socket), pending, chunk_size, drain_limit, input_close_status).await {
                warn!(cause = %e, "failed to drain an unfinished websocket message, aborting");
                socket.abort();
            }
            drop(permit);
        });
    }
}

async fn drain_socket(
    socket: Arc<dyn WebSocket>,
    mut pending: Option<BoxFuture<'static, io::Result<ReceivedFrame>>>,
    chunk_size: usize,
    limit: u64,
    input_close_status: Arc<OnceLock<CloseStatus>>,
) -> Result<(), TransportError> {
    let mut drained = 0u64;
    loop {
        let frame = match pending.take() {
            Some(pending) => pending.await?,
            None => socket.receive(chunk_size).await?,
        };

        if frame.message_type == WebSocketMessageType::Close {
            if let Some(status) = frame.close_status {
                let _ = input_close_status.set(status);
            }
            return Ok(());
        }

        drained += frame.data.len() as u64;
        if drained > limit {
            return Err(TransportError::quota_exceeded(limit));
        }
        if frame.end_of_message {
            debug!(drained, "drained the rest of a websocket message");
            return Ok(());
        }
    }
}

/// Writes one outbound websocket message as a sequence of frames.
///
/// Every write becomes a non final frame. Shutting the writer down sends the empty final frame
/// that ends the message, exactly once.
pub struct WebSocketMessageWriter {
    socket: Arc<dyn WebSocket>,
    message_type: WebSocketMessageType,
    in_flight: Option<(BoxFuture<'static, io::Result<()>>, usize)>,
    end_of_message: AtomicTransition,
}

impl std::fmt::Debug for WebSocketMessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketMessageWriter")
            .field("message_type", &self.message_type)
            .field("in_flight", &self.in_flight.is_some())
            .field("ended", &self.end_of_message.is_started())
            .finish_non_exhaustive()
    }
}

impl WebSocketMessageWriter {
    pub fn new(socket: Arc<dyn WebSocket>, message_type: WebSocketMessageType) -> Self {
        Self { socket, message_type, in_flight: None, end_of_message: AtomicTransition::new() }
    }

    fn send(&self, data: Bytes, end_of_message: bool) -> BoxFuture<'static, io::Result<()>> {
        let socket = Arc::clone(&self.socket);
        let message_type = self.message_type;
        Box::pin(async move { socket.send(data, message_type, end_of_message).await })
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        match self.in_flight.as_mut() {
            None => Poll::Ready(Ok(0)),
            Some((future, len)) => {
                let len = *len;
                let result = ready!(future.as_mut().poll(cx));
                self.in_flight = None;
                Poll::Ready(result.map(|()| len))
            }
        }
    }
}

impl AsyncWrite for WebSocketMessageWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.end_of_message.is_started() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "the message has already ended")));
        }
        if this.in_flight.is_some() {
            return this.poll_in_flight(cx);
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.in_flight = Some((this.send(Bytes::copy_from_slice(buf), false), buf.len()));
        this.poll_in_flight(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.in_flight.is_some() {
                let result = ready!(this.poll_in_flight(cx));
                // once begun, whatever is in flight is the final frame
                if this.end_of_message.is_started() {
                    this.end_of_message.finish();
                    return Poll::Ready(result.map(|_| ()));
                }
                result?;
                continue;
            }

            if !this.end_of_message.try_begin() {
                return Poll::Ready(Ok(()));
            }
            this.in_flight = Some((this.send(Bytes::new(), true), 0));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::websocket::WebSocketState;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Semaphore;

    /// Replays a fixed list of frames and records what was sent.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedWebSocket {
        pub(crate) frames: Mutex<VecDeque<io::Result<ReceivedFrame>>>,
        pub(crate) sent: Mutex<Vec<(Bytes, WebSocketMessageType, bool)>>,
        pub(crate) closes: Mutex<Vec<CloseStatus>>,
        pub(crate) receives: AtomicUsize,
        pub(crate) aborted: std::sync::atomic::AtomicBool,
        pub(crate) fail_sends: std::sync::atomic::AtomicBool,
    }

    impl ScriptedWebSocket {
        pub(crate) fn with_frames<I: IntoIterator<Item = ReceivedFrame>>(frames: I) -> Arc<Self> {
            let socket = Self::default();
            socket.frames.lock().unwrap().extend(frames.into_iter().map(Ok));
            Arc::new(socket)
        }

        pub(crate) fn push(&self, frame: ReceivedFrame) {
            self.frames.lock().unwrap().push_back(Ok(frame));
        }

        pub(crate) fn receive_count(&self) -> usize {
            self.receives.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebSocket for ScriptedWebSocket {
        async fn receive(&self, max_len: usize) -> io::Result<ReceivedFrame> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            loop {
                if self.aborted.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"));
                }
                let next = {
                    let mut frames = self.frames.lock().unwrap();
                    match frames.pop_front() {
                        Some(Ok(mut frame)) if frame.data.len() > max_len => {
                            let rest = frame.data.split_off(max_len);
                            let chunk = ReceivedFrame::data(frame.data, frame.message_type, false);
                            frames.push_front(Ok(ReceivedFrame::data(rest, frame.message_type, frame.end_of_message)));
                            Some(Ok(chunk))
                        }
                        other => other,
                    }
                };
                match next {
                    Some(result) => return result,
                    None => tokio::time::sleep(std::time::Duration::from_millis(1)).await,
                }
            }
        }

        async fn send(&self, data: Bytes, message_type: WebSocketMessageType, end_of_message: bool) -> io::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send failed"));
            }
            self.sent.lock().unwrap().push((data, message_type, end_of_message));
            Ok(())
        }

        async fn close_output(&self, status: CloseStatus) -> io::Result<()> {
            self.closes.lock().unwrap().push(status);
            Ok(())
        }

        fn state(&self) -> WebSocketState {
            if self.aborted.load(Ordering::SeqCst) { WebSocketState::Aborted } else { WebSocketState::Open }
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn binary(data: &'static [u8], end_of_message: bool) -> ReceivedFrame {
        ReceivedFrame::data(Bytes::from_static(data), WebSocketMessageType::Binary, end_of_message)
    }

    async fn stream_over(socket: &Arc<ScriptedWebSocket>, first: ReceivedFrame, gate: &Arc<Semaphore>) -> WebSocketStream {
        let permit = Arc::clone(gate).acquire_owned().await.unwrap();
        let socket: Arc<dyn WebSocket> = Arc::clone(socket) as Arc<dyn WebSocket>;
        WebSocketStream::new(socket, first, 4, 1024, Arc::new(OnceLock::new()), permit)
    }

    #[tokio::test]
    async fn reads_look_ahead_then_socket_until_end_of_message() {
        let socket = ScriptedWebSocket::with_frames([binary(b"def", false), binary(b"gh", true), binary(b"next", true)]);
        let gate = Arc::new(Semaphore::new(1));
        let mut stream = stream_over(&socket, binary(b"abc", false), &gate).await;

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdefgh");
        assert!(stream.is_end_of_message());
        // the next message is left untouched
        assert_eq!(socket.frames.lock().unwrap().len(), 1);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn close_frame_mid_message_is_a_protocol_error() {
        let socket = ScriptedWebSocket::with_frames([ReceivedFrame::close(CloseStatus::normal())]);
        let gate = Arc::new(Semaphore::new(1));
        let mut stream = stream_over(&socket, binary(b"abc", false), &gate).await;

        let mut out = Vec::new();
        let error = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(TransportError::from_io(error), TransportError::Protocol { .. }));
        assert_eq!(stream.input_close_status.get(), Some(&CloseStatus::normal()));
    }

    #[tokio::test]
    async fn dropping_mid_message_drains_before_release() {
        let socket = ScriptedWebSocket::with_frames([binary(b"rest-of-it", true), binary(b"next", true)]);
        let gate = Arc::new(Semaphore::new(1));
        let stream = stream_over(&socket, binary(b"abc", false), &gate).await;
        drop(stream);

        let _permit = Arc::clone(&gate).acquire_owned().await.unwrap();
        let remaining = socket.frames.lock().unwrap().len();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn writer_sends_frames_and_one_final_frame() {
        let socket = Arc::new(ScriptedWebSocket::default());
        let mut writer = WebSocketMessageWriter::new(Arc::clone(&socket) as Arc<dyn WebSocket>, WebSocketMessageType::Text);

        writer.write_all(b"hello").await.unwrap();
        writer.write_all(b" world").await.unwrap();
        writer.shutdown().await.unwrap();
        writer.shutdown().await.unwrap();
        assert!(writer.write_all(b"late").await.is_err());

        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0].0[..], b"hello");
        assert!(!sent[1].2);
        assert!(sent[2].0.is_empty() && sent[2].2);
        assert!(sent.iter().all(|(_, message_type, _)| *message_type == WebSocketMessageType::Text));
    }
}
