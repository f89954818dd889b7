//! RFC 6455 frame codec.
//!
//! The codec only deals with single frames. Reassembly of fragmented messages and the control
//! frame handling live in [`FramedWebSocket`](super::FramedWebSocket).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const FIN: u8 = 0x80;
const RSV: u8 = 0x70;
const MASK: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Expects masked frames and sends unmasked ones.
    Server,
    Client,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(value: u8) -> io::Result<Self> {
        match value & 0x0F {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(invalid_data(format!("unknown opcode 0x{other:X}"))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: Bytes) -> Self {
        Self { fin, opcode, payload }
    }
}

#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self { role, max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        if first & RSV != 0 {
            return Err(invalid_data("reserved bits must be 0"));
        }

        let fin = first & FIN != 0;
        let opcode = OpCode::from_u8(first)?;
        let masked = second & MASK != 0;

        match (self.role, masked) {
            (Role::Server, false) => return Err(invalid_data("client frames must be masked")),
            (Role::Client, true) => return Err(invalid_data("server frames must not be masked")),
            _ => {}
        }

        let (payload_len, length_size) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 8)
            }
            len => (u64::from(len), 0),
        };

        if opcode.is_control() && (!fin || payload_len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(invalid_data("control frames must be final and at most 125 bytes"));
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(invalid_data(format!("frame of {payload_len} bytes exceeds the limit {}", self.max_frame_size)));
        }

        let payload_len = payload_len as usize;
        let header_len = 2 + length_size + if masked { 4 } else { 0 };
        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        let mask = masked.then(|| {
            let offset = header_len - 4;
            [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]]
        });

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame { fin, opcode, payload: payload.freeze() }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        let mask_bit = if self.role == Role::Client { MASK } else { 0 };

        dst.reserve(14 + len);
        dst.put_u8((if frame.fin { FIN } else { 0 }) | frame.opcode.as_u8());
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if self.role == Role::Client {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn invalid_data<S: Into<String>>(message: S) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Encodes the payload of a close frame.
pub fn close_payload(code: u16, description: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + description.len());
    payload.put_u16(code);
    // control payloads are capped at 125 bytes
    let mut end = description.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !description.is_char_boundary(end) {
        end -= 1;
    }
    payload.put_slice(&description.as_bytes()[..end]);
    payload.freeze()
}

/// Decodes the payload of a close frame, `None` when it carries no status code.
pub fn parse_close_payload(payload: &[u8]) -> io::Result<Option<(u16, String)>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(invalid_data("close frame payload of a single byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let description =
                std::str::from_utf8(&payload[2..]).map_err(|_| invalid_data("close reason is not valid utf-8"))?;
            Ok(Some((code, description.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_masked_text_frame() {
        // "Hello" masked with 37 fa 21 3d, from RFC 6455 section 5.7
        let mut buffer = BytesMut::from(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..]);
        let frame = FrameCodec::new(Role::Server, 1024).decode(&mut buffer).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut buffer = BytesMut::from(&[0x82, 0x85, 0x00][..]);
        assert!(FrameCodec::new(Role::Server, 1024).decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn server_rejects_unmasked_frames() {
        let mut buffer = BytesMut::from(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'][..]);
        let error = FrameCodec::new(Role::Server, 1024).decode(&mut buffer).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn client_frames_decode_on_the_server() {
        let mut client = FrameCodec::new(Role::Client, 1 << 20);
        let mut server = FrameCodec::new(Role::Server, 1 << 20);
        let payload = Bytes::from(vec![7u8; 70_000]);

        let mut wire = BytesMut::new();
        client.encode(Frame::new(false, OpCode::Binary, payload.clone()), &mut wire).unwrap();
        client.encode(Frame::new(true, OpCode::Continuation, Bytes::from_static(b"end")), &mut wire).unwrap();

        let first = server.decode(&mut wire).unwrap().unwrap();
        assert!(!first.fin);
        assert_eq!(first.payload, payload);

        let second = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(second.opcode, OpCode::Continuation);
        assert_eq!(&second.payload[..], b"end");
    }

    #[test]
    fn independent_clients_use_different_masks() {
        let frame = Frame::new(true, OpCode::Binary, Bytes::from_static(b"payload"));
        let mut first = BytesMut::new();
        let mut second = BytesMut::new();
        FrameCodec::new(Role::Client, 1024).encode(frame.clone(), &mut first).unwrap();
        FrameCodec::new(Role::Client, 1024).encode(frame, &mut second).unwrap();
        assert_ne!(first[2..6], second[2..6]);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut client = FrameCodec::new(Role::Client, 1 << 20);
        let mut wire = BytesMut::new();
        client.encode(Frame::new(true, OpCode::Binary, Bytes::from(vec![0u8; 200])), &mut wire).unwrap();
        assert!(FrameCodec::new(Role::Server, 100).decode(&mut wire).is_err());
    }

    #[test]
    fn close_payload_round_trip() {
        let payload = close_payload(crate::websocket::CloseStatus::NORMAL_CLOSURE, "bye");
        assert_eq!(parse_close_payload(&payload).unwrap(), Some((1000, "bye".to_string())));
        assert_eq!(parse_close_payload(&[]).unwrap(), None);
    }
}
