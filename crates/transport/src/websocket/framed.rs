//! A [`WebSocket`] over any upgraded byte stream.

use crate::websocket::codec::{Frame, FrameCodec, OpCode, Role, close_payload, parse_close_payload};
use crate::websocket::{CloseStatus, ReceivedFrame, WebSocket, WebSocketMessageType, WebSocketState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct ReadState<IO> {
    frames: FramedRead<ReadHalf<IO>, FrameCodec>,
    /// Type of the data message currently being reassembled.
    message_type: Option<WebSocketMessageType>,
    /// Rest of a data frame larger than the last requested chunk.
    pending: Option<(Bytes, bool)>,
    /// Trailing bytes of a text message ending inside a code point.
    utf8_tail: Vec<u8>,
}

struct WriteState<IO> {
    frames: FramedWrite<WriteHalf<IO>, FrameCodec>,
    in_message: bool,
}

pub struct FramedWebSocket<IO> {
    reader: tokio::sync::Mutex<ReadState<IO>>,
    writer: tokio::sync::Mutex<WriteState<IO>>,
    state: Mutex<WebSocketState>,
    cancel: CancellationToken,
}

impl<IO> FramedWebSocket<IO>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    /// The accepting side of an upgraded connection.
    pub fn server(io: IO, max_frame_size: usize) -> Self {
        Self::new(io, Role::Server, max_frame_size)
    }

    pub fn client(io: IO, max_frame_size: usize) -> Self {
        Self::new(io, Role::Client, max_frame_size)
    }

    fn new(io: IO, role: Role, max_frame_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: tokio::sync::Mutex::new(ReadState {
                frames: FramedRead::new(read_half, FrameCodec::new(role, max_frame_size)),
                message_type: None,
                pending: None,
                utf8_tail: Vec::new(),
            }),
            writer: tokio::sync::Mutex::new(WriteState {
                frames: FramedWrite::new(write_half, FrameCodec::new(role, max_frame_size)),
                in_message: false,
            }),
            state: Mutex::new(WebSocketState::Open),
            cancel: CancellationToken::new(),
        }
    }

    fn set_state(&self, f: impl FnOnce(WebSocketState) -> WebSocketState) {
        if let Ok(mut state) = self.state.lock() {
            *state = f(*state);
        }
    }

    async fn write_frame(&self, writer: &mut WriteState<IO>, frame: Frame) -> io::Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(aborted()),
            result = writer.frames.send(frame) => result,
        }
    }

    /// Fails the connection with 1007 when a text message is not UTF-8.
    async fn check_text(&self, reader: &mut ReadState<IO>, frame: &Frame) -> io::Result<()> {
        if reader.message_type != Some(WebSocketMessageType::Text)
            || validate_utf8(&mut reader.utf8_tail, &frame.payload, frame.fin)
        {
            return Ok(());
        }

        reader.utf8_tail.clear();
        debug!("received a text message that is not valid utf-8");
        self.close_output(CloseStatus::new(CloseStatus::INVALID_PAYLOAD_DATA, "invalid utf-8")).await?;
        Err(io::Error::new(io::ErrorKind::InvalidData, "text message is not valid utf-8"))
    }

    async fn on_close_frame(&self, payload: &[u8]) -> io::Result<CloseStatus> {
        let status = match parse_close_payload(payload)? {
            Some((code, description)) => CloseStatus::new(code, description),
            None => CloseStatus::empty(),
        };
        debug!(code = status.code, description = %status.description, "received close frame");

        let echo = matches!(self.state(), WebSocketState::Open);
        self.set_state(|state| match state {
            WebSocketState::Open | WebSocketState::CloseSent => WebSocketState::Closed,
            other => other,
        });

        if echo {
            let code = if status.code == CloseStatus::EMPTY { CloseStatus::NORMAL_CLOSURE } else { status.code };
            let mut writer = self.writer.lock().await;
            self.write_frame(&mut writer, Frame::new(true, OpCode::Close, close_payload(code, ""))).await?;
        }
        Ok(status)
    }
}

#[async_trait]
impl<IO> WebSocket for FramedWebSocket<IO>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn receive(&self, max_len: usize) -> io::Result<ReceivedFrame> {
        let max_len = max_len.max(1);
        let mut reader = self.reader.lock().await;

        loop {
            if let Some((mut data, fin)) = reader.pending.take() {
                let message_type = reader.message_type.unwrap_or(WebSocketMessageType::Binary);
                if data.len() > max_len {
                    let chunk = data.split_to(max_len);
                    reader.pending = Some((data, fin));
                    return Ok(ReceivedFrame::data(chunk, message_type, false));
                }
                if fin {
                    reader.message_type = None;
                }
                return Ok(ReceivedFrame::data(data, message_type, fin));
            }

            let next = tokio::select! {
                () = self.cancel.cancelled() => return Err(aborted()),
                next = reader.frames.next() => next,
            };

            let frame = match next {
                Some(frame) => frame?,
                None => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed without a close frame"));
                }
            };
            trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "received frame");

            match frame.opcode {
                OpCode::Ping => {
                    let mut writer = self.writer.lock().await;
                    self.write_frame(&mut writer, Frame::new(true, OpCode::Pong, frame.payload)).await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let status = self.on_close_frame(&frame.payload).await?;
                    return Ok(ReceivedFrame::close(status));
                }
                OpCode::Text | OpCode::Binary => {
                    if reader.message_type.is_some() {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "new message before the previous ended"));
                    }
                    let message_type =
                        if frame.opcode == OpCode::Text { WebSocketMessageType::Text } else { WebSocketMessageType::Binary };
                    reader.message_type = Some(message_type);
                    self.check_text(&mut reader, &frame).await?;
                    reader.pending = Some((frame.payload, frame.fin));
                }
                OpCode::Continuation => {
                    if reader.message_type.is_none() {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "continuation frame without a message"));
                    }
                    self.check_text(&mut reader, &frame).await?;
                    reader.pending = Some((frame.payload, frame.fin));
                }
            }
        }
    }

    async fn send(&self, data: Bytes, message_type: WebSocketMessageType, end_of_message: bool) -> io::Result<()> {
        let opcode = match message_type {
            WebSocketMessageType::Text => OpCode::Text,
            WebSocketMessageType::Binary => OpCode::Binary,
            WebSocketMessageType::Close => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "close frames are sent through close_output"));
            }
        };

        if !matches!(self.state(), WebSocketState::Open | WebSocketState::CloseReceived) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "the output side is closed"));
        }

        let mut writer = self.writer.lock().await;
        let opcode = if writer.in_message { OpCode::Continuation } else { opcode };
        writer.in_message = !end_of_message;
        self.write_frame(&mut writer, Frame::new(end_of_message, opcode, data)).await
    }

    async fn close_output(&self, status: CloseStatus) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match self.state() {
            WebSocketState::Open | WebSocketState::CloseReceived => {}
            _ => return Ok(()),
        }

        self.write_frame(&mut writer, Frame::new(true, OpCode::Close, close_payload(status.code, &status.description)))
            .await?;
        self.set_state(|state| match state {
            WebSocketState::Open => WebSocketState::CloseSent,
            WebSocketState::CloseReceived => WebSocketState::Closed,
            other => other,
        });
        Ok(())
    }

    fn state(&self) -> WebSocketState {
        self.state.lock().map(|state| *state).unwrap_or(WebSocketState::Aborted)
    }

    fn abort(&self) {
        self.set_state(|_| WebSocketState::Aborted);
        self.cancel.cancel();
    }
}

impl<IO> fmt::Debug for FramedWebSocket<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().map(|state| *state).ok();
        f.debug_struct("FramedWebSocket").field("state", &state).finish_non_exhaustive()
    }
}

/// Validates the next part of a text message, carrying an incomplete code point over in `tail`.
fn validate_utf8(tail: &mut Vec<u8>, payload: &[u8], fin: bool) -> bool {
    let joined;
    let bytes = if tail.is_empty() {
        payload
    } else {
        joined = [tail.as_slice(), payload].concat();
        joined.as_slice()
    };

    match std::str::from_utf8(bytes) {
        Ok(_) => {
            tail.clear();
            true
        }
        Err(e) if e.error_len().is_none() && !fin => {
            *tail = bytes[e.valid_up_to()..].to_vec();
            true
        }
        Err(_) => false,
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "web socket aborted")
}
