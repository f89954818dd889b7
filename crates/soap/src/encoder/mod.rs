//! Conversion between a [`Message`] and the bytes a transport carries.
//!
//! Transports treat the wire format as opaque: they ask a [`MessageEncoder`] whether a content
//! type is acceptable, hand it a buffer or a stream to decode, and ask it to serialize a reply
//! either into a pooled buffer or straight onto a writer.

mod compress;
mod content_type;
mod envelope;

pub use content_type::BinaryVersion;
pub use content_type::CompressionFormat;
pub use content_type::compression_of;
pub use content_type::content_type_for_compression;
pub use content_type::get_http_response_type_and_encoding_for_compression;
pub use envelope::EnvelopeEncoder;

use crate::buffer::BufferManager;
use crate::error::EncodingError;
use crate::message::{BodyStream, Message, MessageVersion};
use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt::Debug;
use tokio::io::AsyncWrite;

/// The compression the peer accepts for replies, recorded on a message by the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompressionProperty(pub CompressionFormat);

#[async_trait]
pub trait MessageEncoder: Send + Sync + Debug {
    /// The content type announced for messages written by this encoder.
    fn content_type(&self) -> &str;

    /// The content type without parameters.
    fn media_type(&self) -> &str;

    fn message_version(&self) -> MessageVersion;

    /// Returns true if a payload announced with `content_type` can be decoded.
    ///
    /// The default implementation compares media types, ignoring parameters and ASCII case.
    fn is_content_type_supported(&self, content_type: &str) -> bool {
        media_type_matches(content_type, self.media_type())
    }

    /// Whether the encoder can compress and decompress payloads.
    fn compression_enabled(&self) -> bool {
        false
    }

    /// Decodes a complete payload. The encoder owns `buffer` from here on and returns it to the
    /// manager once it is done with it, on success and on failure alike.
    fn read_message(
        &self,
        buffer: BytesMut,
        buffer_manager: &BufferManager,
        content_type: Option<&str>,
    ) -> Result<Message, EncodingError>;

    /// Decodes the headers from `stream` and leaves the rest of it as the message body.
    async fn read_message_stream(
        &self,
        stream: BodyStream,
        max_size_of_headers: usize,
        content_type: Option<&str>,
    ) -> Result<Message, EncodingError>;

    /// Serializes `message` into a buffer taken from `buffer_manager`. The caller returns the
    /// buffer to the manager.
    async fn write_message(
        &self,
        message: &mut Message,
        max_message_size: usize,
        buffer_manager: &BufferManager,
    ) -> Result<BytesMut, EncodingError>;

    /// Serializes `message` directly onto `writer`.
    async fn write_message_to(
        &self,
        message: &mut Message,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), EncodingError>;
}

/// Compares the media type part of two content types.
pub fn media_type_matches(content_type: &str, media_type: &str) -> bool {
    match (content_type.parse::<mime::Mime>(), media_type.parse::<mime::Mime>()) {
        (Ok(left), Ok(right)) => left.essence_str().eq_ignore_ascii_case(right.essence_str()),
        _ => {
            let left = content_type.split(';').next().unwrap_or_default().trim();
            let right = media_type.split(';').next().unwrap_or_default().trim();
            left.eq_ignore_ascii_case(right)
        }
    }
}
