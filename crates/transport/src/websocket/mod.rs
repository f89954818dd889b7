//! Messages over an upgraded websocket connection.
//!
//! [`WebSocketUpgrade`] answers the opening handshake, [`FramedWebSocket`] speaks RFC 6455 over
//! the upgraded I/O, and [`WebSocketTransportDuplexSessionChannel`] turns the frames into
//! messages in both directions.

mod channel;
mod codec;
mod framed;
mod socket;
mod source;
mod stream;
mod upgrade;

pub use channel::WebSocketTransportDuplexSessionChannel;
pub use codec::{Frame, FrameCodec, OpCode, Role};
pub use framed::FramedWebSocket;
pub use socket::{CloseStatus, ReceivedFrame, WebSocket, WebSocketMessageType, WebSocketState};
pub use source::{AsyncReceiveState, WebSocketMessageSource};
pub use stream::{WebSocketMessageWriter, WebSocketStream};
pub use upgrade::{WebSocketContext, WebSocketMessageProperty, WebSocketUpgrade};
