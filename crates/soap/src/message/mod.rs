//! The protocol level unit exchanged between a client and a service.
//!
//! A [`Message`] carries addressing [`MessageHeaders`], a typed [`MessageProperties`] bag for
//! transport metadata, and a body that can be consumed exactly once, either as a buffer or as a
//! stream. Whoever finishes consuming a message closes it; closing twice is a no-op that reports
//! `false`.

mod headers;
mod properties;
mod version;

pub use headers::MessageHeaders;
pub use properties::MessageProperties;
pub use version::AddressingVersion;
pub use version::EnvelopeVersion;
pub use version::MessageVersion;

use crate::error::EncodingError;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A message body read straight from the transport.
pub type BodyStream = Pin<Box<dyn AsyncRead + Send>>;

pub enum MessageBody {
    Empty,
    Buffered(Bytes),
    Streamed(BodyStream),
}

impl MessageBody {
    pub fn is_streamed(&self) -> bool {
        matches!(self, MessageBody::Streamed(_))
    }

    /// Reads the whole body into memory, failing once more than `limit` bytes were seen.
    pub async fn into_bytes(self, limit: usize) -> Result<Bytes, EncodingError> {
        match self {
            MessageBody::Empty => Ok(Bytes::new()),
            MessageBody::Buffered(bytes) if bytes.len() > limit => Err(EncodingError::quota_exceeded(limit as u64)),
            MessageBody::Buffered(bytes) => Ok(bytes),
            MessageBody::Streamed(mut stream) => {
                let mut buf = BytesMut::with_capacity(limit.min(8 * 1024));
                loop {
                    if buf.len() > limit {
                        return Err(EncodingError::quota_exceeded(limit as u64));
                    }
                    buf.reserve(4 * 1024);
                    if stream.read_buf(&mut buf).await? == 0 {
                        break;
                    }
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageBody::Empty => f.write_str("Empty"),
            MessageBody::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            MessageBody::Streamed(_) => f.write_str("Streamed"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageState {
    Created,
    /// The body has been handed to a reader.
    Read,
    /// The body has been handed to a writer.
    Written,
    Closed,
}

pub struct Message {
    version: MessageVersion,
    headers: MessageHeaders,
    properties: MessageProperties,
    via: Option<String>,
    body: Option<MessageBody>,
    state: MessageState,
    is_empty: bool,
    allow_output_batching: bool,
}

impl Message {
    pub fn new(version: MessageVersion, headers: MessageHeaders, body: MessageBody) -> Self {
        Self {
            version,
            headers,
            properties: MessageProperties::new(),
            via: None,
            body: Some(body),
            state: MessageState::Created,
            is_empty: false,
            allow_output_batching: false,
        }
    }

    pub fn buffered(version: MessageVersion, headers: MessageHeaders, body: impl Into<Bytes>) -> Self {
        Self::new(version, headers, MessageBody::Buffered(body.into()))
    }

    pub fn streamed(version: MessageVersion, headers: MessageHeaders, body: BodyStream) -> Self {
        Self::new(version, headers, MessageBody::Streamed(body))
    }

    /// The null message placeholder: no headers, no body.
    pub fn empty(version: MessageVersion) -> Self {
        let mut message = Self::new(version, MessageHeaders::new(), MessageBody::Empty);
        message.is_empty = true;
        message
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    #[inline]
    pub fn version(&self) -> MessageVersion {
        self.version
    }

    #[inline]
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    #[inline]
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    #[inline]
    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    /// The address the message physically arrived at.
    pub fn via(&self) -> Option<&str> {
        self.via.as_deref()
    }

    pub fn set_via<S: Into<String>>(&mut self, via: S) {
        self.via = Some(via.into());
    }

    #[inline]
    pub fn state(&self) -> MessageState {
        self.state
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == MessageState::Closed
    }

    pub fn allow_output_batching(&self) -> bool {
        self.allow_output_batching
    }

    pub fn set_allow_output_batching(&mut self, allow: bool) {
        self.allow_output_batching = allow;
    }

    /// Returns true if the body is still present and is a stream.
    pub fn is_streamed(&self) -> bool {
        self.body.as_ref().is_some_and(MessageBody::is_streamed)
    }

    /// Takes the body for reading. The body is available exactly once.
    pub fn take_body(&mut self) -> Result<MessageBody, EncodingError> {
        self.take_body_as(MessageState::Read)
    }

    /// Takes the body for writing it out to a transport.
    pub fn take_body_for_write(&mut self) -> Result<MessageBody, EncodingError> {
        self.take_body_as(MessageState::Written)
    }

    fn take_body_as(&mut self, next: MessageState) -> Result<MessageBody, EncodingError> {
        if self.state == MessageState::Closed {
            return Err(EncodingError::invalid_state("message is closed"));
        }
        let body = self.body.take().ok_or(EncodingError::BodyConsumed)?;
        self.state = next;
        Ok(body)
    }

    /// Closes the message, dropping any unread body. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == MessageState::Closed {
            return false;
        }
        self.body.take();
        self.state = MessageState::Closed;
        true
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("properties", &self.properties)
            .field("via", &self.via)
            .field("body", &self.body)
            .field("state", &self.state)
            .field("is_empty", &self.is_empty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_consumed_once() {
        let mut message = Message::buffered(MessageVersion::SOAP12_WSA10, MessageHeaders::new(), &b"payload"[..]);
        assert!(matches!(message.take_body(), Ok(MessageBody::Buffered(_))));
        assert_eq!(message.state(), MessageState::Read);
        assert!(matches!(message.take_body(), Err(EncodingError::BodyConsumed)));
    }

    #[test]
    fn close_is_reported_once() {
        let mut message = Message::empty(MessageVersion::NONE);
        assert!(message.is_empty());
        assert!(message.close());
        assert!(!message.close());
        assert!(matches!(message.take_body(), Err(EncodingError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn streamed_body_respects_limit() {
        let stream: BodyStream = Box::pin(&b"0123456789"[..]);
        let body = MessageBody::Streamed(stream);
        assert!(matches!(body.into_bytes(4).await, Err(EncodingError::QuotaExceeded { limit: 4 })));

        let stream: BodyStream = Box::pin(&b"0123"[..]);
        let bytes = MessageBody::Streamed(stream).into_bytes(4).await.unwrap();
        assert_eq!(&bytes[..], b"0123");
    }
}
