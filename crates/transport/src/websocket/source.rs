//! The receive loop turning websocket frames into messages.

use crate::error::TransportError;
use crate::io::{MaxMessageSizeStream, TimeoutStream};
use crate::settings::HttpTransportSettings;
use crate::websocket::stream::WebSocketStream;
use crate::websocket::{CloseStatus, ReceivedFrame, WebSocket, WebSocketContext, WebSocketMessageProperty, WebSocketMessageType};
use micro_soap::message::Message;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Size of the first buffer a buffered receive fills, doubled as needed up to `max_buffer_size`.
const INITIAL_RECEIVE_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AsyncReceiveState {
    Finished,
    Started,
    /// The last caller gave up waiting; the socket read itself keeps going.
    Cancelled,
}

type ReceiveResult = Result<Option<Message>, TransportError>;

struct ReceiveSlot {
    state: AsyncReceiveState,
    pending: Option<JoinHandle<ReceiveResult>>,
    faulted: bool,
}

struct SourceShared {
    socket: Arc<dyn WebSocket>,
    settings: Arc<HttpTransportSettings>,
    context: Option<WebSocketContext>,
    input_close_status: Arc<OnceLock<CloseStatus>>,
    /// Held by a streamed message until its body is released.
    read_gate: Arc<Semaphore>,
}

/// Receives the messages of one websocket session, one at a time.
///
/// The next socket read is only issued after the previous message was handed to a caller, so a
/// slow consumer pushes back on the peer. A receive that times out leaves the socket read
/// running; the next call waits for that same read.
pub struct WebSocketMessageSource {
    shared: Arc<SourceShared>,
    slot: Mutex<ReceiveSlot>,
}

impl WebSocketMessageSource {
    /// Creates the source and immediately starts receiving the first message. Must be called
    /// from within a tokio runtime.
    pub fn new(socket: Arc<dyn WebSocket>, settings: Arc<HttpTransportSettings>, context: Option<WebSocketContext>) -> Self {
        let shared = Arc::new(SourceShared {
            socket,
            settings,
            context,
            input_close_status: Arc::new(OnceLock::new()),
            read_gate: Arc::new(Semaphore::new(1)),
        });

        let pending = Some(start_next_receive(&shared));
        Self { shared, slot: Mutex::new(ReceiveSlot { state: AsyncReceiveState::Started, pending, faulted: false }) }
    }

    /// Returns the next message, or `None` once the peer closed its side.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        let mut slot = self.slot.lock().await;

        let Some(pending) = slot.pending.as_mut() else {
            if slot.faulted {
                return Err(TransportError::communication("the websocket message source has faulted"));
            }
            return Ok(None);
        };

        let joined = match tokio::time::timeout(timeout, pending).await {
            Ok(joined) => joined,
            Err(_) => {
                slot.state = AsyncReceiveState::Cancelled;
                debug!(?timeout, "websocket receive timed out, the read stays pending");
                return Err(TransportError::timeout("receive", timeout));
            }
        };

        slot.pending = None;
        slot.state = AsyncReceiveState::Finished;

        let result = joined.unwrap_or_else(|e| Err(TransportError::aborted(format!("receive task ended: {e}"))));
        match result {
            Ok(Some(message)) => {
                slot.pending = Some(start_next_receive(&self.shared));
                slot.state = AsyncReceiveState::Started;
                Ok(Some(message))
            }
            Ok(None) => {
                debug!(close_status = ?self.shared.input_close_status.get(), "websocket input closed");
                Ok(None)
            }
            Err(e) => {
                slot.faulted = true;
                Err(e)
            }
        }
    }

    pub async fn receive_state(&self) -> AsyncReceiveState {
        self.slot.lock().await.state
    }

    /// The close status sent by the peer, once its close frame arrived.
    pub fn input_close_status(&self) -> Option<CloseStatus> {
        self.shared.input_close_status.get().cloned()
    }

    pub fn abort(&self) {
        self.shared.socket.abort();
    }
}

impl std::fmt::Debug for WebSocketMessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketMessageSource")
            .field("socket", &self.shared.socket)
            .field("input_close_status", &self.shared.input_close_status.get())
            .finish_non_exhaustive()
    }
}

fn start_next_receive(shared: &Arc<SourceShared>) -> JoinHandle<ReceiveResult> {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let result = if shared.settings.transfer_mode().is_request_streamed() {
            read_streamed_message(&shared).await
        } else {
            read_buffered_message(&shared).await
        };

        result.inspect_err(|e| match e {
            TransportError::Aborted { .. } | TransportError::Timeout { .. } => debug!(cause = %e, "websocket receive ended"),
            _ => error!(cause = %e, "websocket receive failed"),
        })
    })
}

/// Records the peer's close status, returns true when `frame` is a close frame.
fn check_close_status(shared: &SourceShared, frame: &ReceivedFrame) -> bool {
    if frame.message_type != WebSocketMessageType::Close {
        return false;
    }
    let status = frame.close_status.clone().unwrap_or_else(CloseStatus::empty);
    if shared.input_close_status.set(status).is_err() {
        trace!("close status already recorded");
    }
    true
}

async fn read_buffered_message(shared: &SourceShared) -> ReceiveResult {
    let settings = &shared.settings;
    let buffers = settings.buffer_manager();
    let max_size = settings.max_buffer_size();

    let mut buffer = buffers.take_buffer(INITIAL_RECEIVE_BUFFER_SIZE.min(max_size));
    let mut filled = 0;
    let mut message_type = None;

    loop {
        if filled == buffer.len() && buffer.len() < max_size {
            let mut larger = buffers.take_buffer((buffer.len() * 2).max(1).min(max_size));
            larger[..filled].copy_from_slice(&buffer[..filled]);
            buffers.return_buffer(std::mem::replace(&mut buffer, larger));
        }

        let room = buffer.len() - filled;
        let frame = match shared.socket.receive(room.max(1)).await {
            Ok(frame) => frame,
            Err(e) => {
                buffers.return_buffer(buffer);
                return Err(TransportError::from_io(e));
            }
        };

        if check_close_status(shared, &frame) {
            buffers.return_buffer(buffer);
            return Ok(None);
        }

        if frame.data.len() > room {
            buffers.return_buffer(buffer);
            warn!(max_size, "websocket message exceeds the buffer quota");
            return Err(TransportError::quota_exceeded(max_size as u64));
        }

        buffer[filled..filled + frame.data.len()].copy_from_slice(&frame.data);
        filled += frame.data.len();
        message_type.get_or_insert(frame.message_type);

        if frame.end_of_message {
            break;
        }
    }

    let mut exact = buffers.take_buffer(filled);
    exact.copy_from_slice(&buffer[..filled]);
    buffers.return_buffer(buffer);

    let encoder = settings.encoder();
    let mut message = encoder.read_message(exact, buffers, Some(encoder.content_type()))?;
    attach_properties(shared, &mut message, message_type.unwrap_or(WebSocketMessageType::Binary));
    Ok(Some(message))
}

async fn read_streamed_message(shared: &SourceShared) -> ReceiveResult {
    let settings = &shared.settings;
    let permit = Arc::clone(&shared.read_gate)
        .acquire_owned()
        .await
        .map_err(|_| TransportError::aborted("websocket message source closed"))?;

    let chunk_size = INITIAL_RECEIVE_BUFFER_SIZE.min(settings.max_buffer_size()).max(1);
    let frame = shared.socket.receive(chunk_size).await?;
    if check_close_status(shared, &frame) {
        return Ok(None);
    }

    let message_type = frame.message_type;
    let limit = settings.max_received_message_size();
    let stream = WebSocketStream::new(
        Arc::clone(&shared.socket),
        frame,
        chunk_size,
        limit,
        Arc::clone(&shared.input_close_status),
        permit,
    );
    let stream = MaxMessageSizeStream::new(TimeoutStream::new(stream, settings.receive_timeout(), "receive"), limit);

    let encoder = settings.encoder();
    let mut message =
        encoder.read_message_stream(Box::pin(stream), settings.max_size_of_headers(), Some(encoder.content_type())).await?;
    attach_properties(shared, &mut message, message_type);
    Ok(Some(message))
}

fn attach_properties(shared: &SourceShared, message: &mut Message, message_type: WebSocketMessageType) {
    let mut property = WebSocketMessageProperty::new(message_type);
    if let Some(context) = &shared.context {
        property.sub_protocol = context.sub_protocol().map(str::to_string);
        property.context = Some(context.clone());
        message.set_via(context.request_uri());
    }
    message.properties_mut().insert(property);
}
