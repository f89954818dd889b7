use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt::Debug;
use std::io;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketMessageType {
    Text,
    Binary,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub description: String,
}

impl CloseStatus {
    pub const NORMAL_CLOSURE: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Reported when a close frame carried no status code.
    pub const EMPTY: u16 = 1005;
    pub const INVALID_PAYLOAD_DATA: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_SERVER_ERROR: u16 = 1011;

    pub fn new<S: Into<String>>(code: u16, description: S) -> Self {
        Self { code, description: description.into() }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL_CLOSURE, "")
    }

    pub fn empty() -> Self {
        Self::new(Self::EMPTY, "")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WebSocketState {
    Open,
    /// We sent a close frame and wait for the peer's.
    CloseSent,
    /// The peer sent a close frame.
    CloseReceived,
    Closed,
    Aborted,
}

/// One chunk handed out by [`WebSocket::receive`].
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub data: Bytes,
    pub message_type: WebSocketMessageType,
    pub end_of_message: bool,
    pub close_status: Option<CloseStatus>,
}

impl ReceivedFrame {
    pub fn data(data: Bytes, message_type: WebSocketMessageType, end_of_message: bool) -> Self {
        Self { data, message_type, end_of_message, close_status: None }
    }

    pub fn close(status: CloseStatus) -> Self {
        Self { data: Bytes::new(), message_type: WebSocketMessageType::Close, end_of_message: true, close_status: Some(status) }
    }
}

/// A message oriented, full duplex socket.
///
/// `receive` hands out a message in chunks of at most `max_len` bytes, the last one flagged as
/// `end_of_message`. Implementations serialize concurrent receivers and concurrent senders
/// internally, but the transports never issue two receives at once.
#[async_trait]
pub trait WebSocket: Send + Sync + Debug {
    async fn receive(&self, max_len: usize) -> io::Result<ReceivedFrame>;

    async fn send(&self, data: Bytes, message_type: WebSocketMessageType, end_of_message: bool) -> io::Result<()>;

    /// Sends a close frame. The input side stays readable until the peer's close frame arrives.
    async fn close_output(&self, status: CloseStatus) -> io::Result<()>;

    fn state(&self) -> WebSocketState;

    /// Tears the connection down without a close handshake. Pending operations fail.
    fn abort(&self);
}
