//! The duplex session channel over an accepted websocket.

use crate::error::TransportError;
use crate::settings::HttpTransportSettings;
use crate::sync::AtomicTransition;
use crate::websocket::source::WebSocketMessageSource;
use crate::websocket::stream::WebSocketMessageWriter;
use crate::websocket::{CloseStatus, WebSocket, WebSocketContext, WebSocketMessageProperty, WebSocketMessageType, WebSocketState};
use micro_soap::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sends and receives messages over one websocket connection.
///
/// Both directions run independently: `send` may be called while a `receive` is pending.
/// Concurrent sends are serialized so the frames of two messages never interleave.
pub struct WebSocketTransportDuplexSessionChannel {
    socket: Arc<dyn WebSocket>,
    settings: Arc<HttpTransportSettings>,
    source: WebSocketMessageSource,
    context: Option<WebSocketContext>,
    send_lock: Mutex<()>,
    owns_socket: bool,
    cleanup: AtomicTransition,
}

impl WebSocketTransportDuplexSessionChannel {
    pub fn new(socket: Arc<dyn WebSocket>, settings: Arc<HttpTransportSettings>, context: Option<WebSocketContext>) -> Self {
        let source = WebSocketMessageSource::new(Arc::clone(&socket), Arc::clone(&settings), context.clone());
        Self {
            socket,
            settings,
            source,
            context,
            send_lock: Mutex::new(()),
            owns_socket: true,
            cleanup: AtomicTransition::new(),
        }
    }

    /// Whether cleanup tears the socket down. Defaults to true.
    pub fn owns_socket(mut self, owns_socket: bool) -> Self {
        self.owns_socket = owns_socket;
        self
    }

    pub fn context(&self) -> Option<&WebSocketContext> {
        self.context.as_ref()
    }

    pub fn state(&self) -> WebSocketState {
        self.socket.state()
    }

    pub fn input_close_status(&self) -> Option<CloseStatus> {
        self.source.input_close_status()
    }

    /// Returns the next message, `None` once the peer closed the session.
    pub async fn receive(&self) -> Result<Option<Message>, TransportError> {
        self.receive_with_timeout(self.settings.receive_timeout()).await
    }

    pub async fn receive_with_timeout(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        self.source.receive(timeout).await
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_with_timeout(message, self.settings.send_timeout()).await
    }

    pub async fn send_with_timeout(&self, mut message: Message, timeout: Duration) -> Result<(), TransportError> {
        let message_type = message
            .properties()
            .get::<WebSocketMessageProperty>()
            .map_or(self.settings.web_socket().default_message_type(), |property| property.message_type);
        if message_type == WebSocketMessageType::Close {
            return Err(TransportError::invalid_operation("a message can't be sent as a close frame"));
        }

        let result = match tokio::time::timeout(timeout, self.send_core(&mut message, message_type)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout("send", timeout)),
        };
        message.close();
        result
    }

    async fn send_core(&self, message: &mut Message, message_type: WebSocketMessageType) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        let encoder = self.settings.encoder();

        if self.settings.transfer_mode().is_response_streamed() {
            let writer = WebSocketMessageWriter::new(Arc::clone(&self.socket), message_type);
            let mut writer = BufWriter::with_capacity(self.settings.web_socket().max_frame_size().min(64 * 1024), writer);
            encoder.write_message_to(message, &mut writer).await?;
            writer.shutdown().await?;
            return Ok(());
        }

        let buffers = self.settings.buffer_manager();
        let buffer = encoder.write_message(message, self.settings.max_buffer_size(), buffers).await?;
        let payload = bytes::Bytes::copy_from_slice(&buffer);
        let result = self.socket.send(payload, message_type, true).await;

        // the pool gets the buffer back whatever the send did
        buffers.return_buffer(buffer);
        result.map_err(TransportError::from_io)
    }

    /// Closes the output, then waits for the peer's close frame within the close timeout.
    /// Messages still arriving are discarded. Falls back to [`abort`](Self::abort) on failure.
    pub async fn close(&self) -> Result<(), TransportError> {
        let timeout = self.settings.close_timeout();
        let result = tokio::time::timeout(timeout, self.close_core()).await;

        let result = match result {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout("close", timeout)),
        };
        match &result {
            Ok(()) => {
                info!(close_status = ?self.input_close_status(), "websocket session closed");
                self.on_cleanup();
            }
            Err(e) => {
                warn!(cause = %e, "websocket close failed, aborting");
                self.abort();
            }
        }
        result
    }

    async fn close_core(&self) -> Result<(), TransportError> {
        {
            let _guard = self.send_lock.lock().await;
            self.socket.close_output(CloseStatus::normal()).await?;
        }

        let mut discarded = 0usize;
        while let Some(mut message) = self.source.receive(self.settings.close_timeout()).await? {
            discarded += 1;
            message.close();
        }
        if discarded > 0 {
            debug!(discarded, "discarded messages received while closing");
        }
        Ok(())
    }

    pub fn abort(&self) {
        debug!("aborting websocket session");
        self.source.abort();
        self.on_cleanup();
    }

    fn on_cleanup(&self) {
        if !self.cleanup.try_begin() {
            return;
        }
        if self.owns_socket {
            self.socket.abort();
        }
        self.cleanup.finish();
    }
}

impl std::fmt::Debug for WebSocketTransportDuplexSessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransportDuplexSessionChannel")
            .field("socket", &self.socket)
            .field("owns_socket", &self.owns_socket)
            .field("cleanup", &self.cleanup.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TransferMode;
    use crate::websocket::FramedWebSocket;
    use crate::websocket::ReceivedFrame;
    use crate::websocket::stream::tests::ScriptedWebSocket;
    use bytes::Bytes;
    use micro_soap::buffer::BufferManager;
    use micro_soap::encoder::EnvelopeEncoder;
    use micro_soap::message::{MessageHeaders, MessageVersion};
    use std::sync::atomic::Ordering;

    fn settings(transfer_mode: TransferMode) -> Arc<HttpTransportSettings> {
        HttpTransportSettings::builder()
            .encoder(Arc::new(EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10)))
            .buffer_manager(Arc::new(BufferManager::default()))
            .max_buffer_size(64 * 1024)
            .max_received_message_size(64 * 1024)
            .transfer_mode(transfer_mode)
            .close_timeout(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    fn request(action: &str, body: &'static str) -> Message {
        Message::buffered(MessageVersion::SOAP12_WSA10, MessageHeaders::new().with_action(action), body)
    }

    #[tokio::test]
    async fn buffered_send_is_one_final_frame_and_returns_the_buffer() {
        let socket = Arc::new(ScriptedWebSocket::default());
        let settings = settings(TransferMode::Buffered);
        let channel = WebSocketTransportDuplexSessionChannel::new(
            Arc::clone(&socket) as Arc<dyn WebSocket>,
            Arc::clone(&settings),
            None,
        );

        let mut message = request("urn:text", "hi");
        message.properties_mut().insert(WebSocketMessageProperty::new(WebSocketMessageType::Text));
        channel.send(message).await.unwrap();

        {
            let sent = socket.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1, WebSocketMessageType::Text);
            assert!(sent[0].2);
            assert!(sent[0].0.ends_with(b"\nhi"));
        }
        assert_eq!(settings.buffer_manager().outstanding(), 0);

        socket.fail_sends.store(true, Ordering::SeqCst);
        assert!(channel.send(request("urn:fail", "x")).await.is_err());
        assert_eq!(settings.buffer_manager().outstanding(), 0);
    }

    #[tokio::test]
    async fn streamed_send_ends_with_an_empty_final_frame() {
        let socket = Arc::new(ScriptedWebSocket::default());
        let channel =
            WebSocketTransportDuplexSessionChannel::new(Arc::clone(&socket) as Arc<dyn WebSocket>, settings(TransferMode::Streamed), None);

        channel.send(request("urn:stream", "payload")).await.unwrap();

        let sent = socket.sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert!(last.0.is_empty() && last.2);
        assert!(sent[..sent.len() - 1].iter().all(|(_, message_type, eom)| !eom && *message_type == WebSocketMessageType::Binary));
        let payload: Vec<u8> = sent.iter().flat_map(|(data, _, _)| data.to_vec()).collect();
        assert!(payload.ends_with(b"\npayload"));
    }

    #[tokio::test]
    async fn close_discards_late_messages_and_cleans_up_once() {
        let socket = ScriptedWebSocket::with_frames([
            ReceivedFrame::data(Bytes::from_static(b"{}\nlate"), WebSocketMessageType::Binary, true),
            ReceivedFrame::close(CloseStatus::normal()),
        ]);
        let channel =
            WebSocketTransportDuplexSessionChannel::new(Arc::clone(&socket) as Arc<dyn WebSocket>, settings(TransferMode::Buffered), None);

        channel.close().await.unwrap();
        assert_eq!(socket.closes.lock().unwrap().as_slice(), &[CloseStatus::normal()]);
        assert_eq!(channel.input_close_status(), Some(CloseStatus::normal()));
        assert!(socket.aborted.load(Ordering::SeqCst));

        channel.abort();
        assert_eq!(channel.cleanup.state(), crate::sync::Transition::Done);
    }

    #[tokio::test]
    async fn echo_over_a_framed_socket() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = Arc::new(FramedWebSocket::server(server_io, 64 * 1024)) as Arc<dyn WebSocket>;
        let client = Arc::new(FramedWebSocket::client(client_io, 64 * 1024)) as Arc<dyn WebSocket>;

        let server_channel = WebSocketTransportDuplexSessionChannel::new(server, settings(TransferMode::Buffered), None);
        let client_channel = WebSocketTransportDuplexSessionChannel::new(client, settings(TransferMode::Streamed), None);

        client_channel.send(request("urn:echo", "ping")).await.unwrap();
        let mut received = server_channel.receive().await.unwrap().unwrap();
        assert_eq!(received.headers().action.as_deref(), Some("urn:echo"));

        let body = received.take_body().unwrap().into_bytes(1024).await.unwrap();
        server_channel.send(Message::buffered(MessageVersion::SOAP12_WSA10, MessageHeaders::new(), body)).await.unwrap();

        let mut reply = client_channel.receive().await.unwrap().unwrap();
        assert_eq!(&reply.take_body().unwrap().into_bytes(1024).await.unwrap()[..], b"ping");

        let (server_closed, client_closed) = tokio::join!(server_channel.close(), client_channel.close());
        server_closed.unwrap();
        client_closed.unwrap();
    }
}
