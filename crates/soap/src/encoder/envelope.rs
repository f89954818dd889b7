//! A compact envelope format: one JSON line of addressing headers followed by the raw body.
//!
//! ```text
//! {"action":"urn:echo","to":"http://host/svc"}\n
//! <body bytes ...>
//! ```
//!
//! Serde escapes newlines inside strings, so the first `\n` always terminates the header line.

use crate::buffer::BufferManager;
use crate::encoder::compress::{compress, decompress};
use crate::encoder::content_type::{BinaryVersion, CompressionFormat, compression_of, content_type_for_compression};
use crate::encoder::{CompressionProperty, MessageEncoder, media_type_matches};
use crate::error::EncodingError;
use crate::message::{BodyStream, Message, MessageBody, MessageHeaders, MessageVersion};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

const HEADER_TERMINATOR: u8 = b'\n';

#[derive(Debug, Clone)]
pub struct EnvelopeEncoder {
    version: MessageVersion,
    content_type: String,
    media_type: String,
    compression: bool,
    max_message_size: usize,
}

impl EnvelopeEncoder {
    pub fn new(version: MessageVersion) -> Self {
        let content_type = BinaryVersion::VERSION1.content_type();
        Self {
            version,
            content_type: content_type.to_string(),
            media_type: content_type.to_string(),
            compression: false,
            max_message_size: 64 * 1024,
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        let content_type = content_type.into();
        self.media_type = content_type.split(';').next().unwrap_or_default().trim().to_string();
        self.content_type = content_type;
        self
    }

    /// Enables gzip / deflate payloads.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Upper bound for payloads that have to be fully materialized, e.g. after inflating.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    fn compression_for_read(&self, content_type: Option<&str>) -> Result<Option<CompressionFormat>, EncodingError> {
        match content_type.and_then(compression_of) {
            Some(format) if self.compression => Ok(Some(format)),
            Some(format) => Err(EncodingError::malformed(format!("{format} payloads are not enabled on this encoder"))),
            None => Ok(None),
        }
    }

    fn compression_for_write(&self, message: &Message) -> Option<CompressionFormat> {
        if !self.compression {
            return None;
        }
        message.properties().get::<CompressionProperty>().map(|property| property.0)
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, EncodingError> {
        let (headers, body) = split_envelope(payload)?;
        Ok(Message::buffered(self.version, headers, Bytes::copy_from_slice(body)))
    }

    fn encode_header(message: &Message) -> Result<Vec<u8>, EncodingError> {
        let mut header = serde_json::to_vec(message.headers()).map_err(EncodingError::malformed)?;
        header.push(HEADER_TERMINATOR);
        Ok(header)
    }
}

#[async_trait]
impl MessageEncoder for EnvelopeEncoder {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn message_version(&self) -> MessageVersion {
        self.version
    }

    fn is_content_type_supported(&self, content_type: &str) -> bool {
        if media_type_matches(content_type, &self.media_type) {
            return true;
        }

        self.compression
            && [CompressionFormat::GZip, CompressionFormat::Deflate].into_iter().any(|format| {
                media_type_matches(content_type, &content_type_for_compression(&self.media_type, format))
            })
    }

    fn compression_enabled(&self) -> bool {
        self.compression
    }

    fn read_message(
        &self,
        buffer: BytesMut,
        buffer_manager: &BufferManager,
        content_type: Option<&str>,
    ) -> Result<Message, EncodingError> {
        let result = self.compression_for_read(content_type).and_then(|compression| match compression {
            Some(format) => decompress(format, &buffer, self.max_message_size).and_then(|inflated| self.decode(&inflated)),
            None => self.decode(&buffer),
        });
        buffer_manager.return_buffer(buffer);
        result
    }

    async fn read_message_stream(
        &self,
        stream: BodyStream,
        max_size_of_headers: usize,
        content_type: Option<&str>,
    ) -> Result<Message, EncodingError> {
        if let Some(format) = self.compression_for_read(content_type)? {
            // an inflated stream can't be split lazily, materialize it
            let compressed = MessageBody::Streamed(stream).into_bytes(self.max_message_size).await?;
            let inflated = decompress(format, &compressed, self.max_message_size)?;
            return self.decode(&inflated);
        }

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let read = (&mut reader).take(max_size_of_headers as u64 + 1).read_until(HEADER_TERMINATOR, &mut line).await?;

        if line.last() != Some(&HEADER_TERMINATOR) {
            if read > max_size_of_headers {
                return Err(EncodingError::quota_exceeded(max_size_of_headers as u64));
            }
            return Err(EncodingError::malformed("missing envelope header terminator"));
        }

        let headers = parse_headers(&line[..line.len() - 1])?;
        trace!(header_size = line.len(), "decoded streamed envelope header");
        Ok(Message::streamed(self.version, headers, Box::pin(reader)))
    }

    async fn write_message(
        &self,
        message: &mut Message,
        max_message_size: usize,
        buffer_manager: &BufferManager,
    ) -> Result<BytesMut, EncodingError> {
        let header = Self::encode_header(message)?;
        let body = message.take_body_for_write()?.into_bytes(max_message_size).await?;

        let payload = match self.compression_for_write(message) {
            Some(format) => {
                let mut plain = Vec::with_capacity(header.len() + body.len());
                plain.extend_from_slice(&header);
                plain.extend_from_slice(&body);
                let compressed = compress(format, &plain)?;
                debug!(plain = plain.len(), compressed = compressed.len(), %format, "compressed message");
                vec![compressed]
            }
            None => vec![Bytes::from(header), body],
        };

        let size: usize = payload.iter().map(Bytes::len).sum();
        if size > max_message_size {
            return Err(EncodingError::quota_exceeded(max_message_size as u64));
        }

        let mut buffer = buffer_manager.take_buffer(size);
        let mut offset = 0;
        for part in payload {
            buffer[offset..offset + part.len()].copy_from_slice(&part);
            offset += part.len();
        }
        Ok(buffer)
    }

    async fn write_message_to(
        &self,
        message: &mut Message,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), EncodingError> {
        let header = Self::encode_header(message)?;
        let body = message.take_body_for_write()?;

        if let Some(format) = self.compression_for_write(message) {
            let body = body.into_bytes(self.max_message_size).await?;
            let mut plain = header;
            plain.extend_from_slice(&body);
            writer.write_all(&compress(format, &plain)?).await?;
            writer.flush().await?;
            return Ok(());
        }

        writer.write_all(&header).await?;
        match body {
            MessageBody::Empty => {}
            MessageBody::Buffered(bytes) => writer.write_all(&bytes).await?,
            MessageBody::Streamed(mut stream) => {
                let copied = tokio::io::copy(&mut stream, writer).await?;
                trace!(copied, "streamed message body");
            }
        }
        writer.flush().await?;
        Ok(())
    }
}

fn split_envelope(payload: &[u8]) -> Result<(MessageHeaders, &[u8]), EncodingError> {
    let position = payload
        .iter()
        .position(|b| *b == HEADER_TERMINATOR)
        .ok_or_else(|| EncodingError::malformed("missing envelope header terminator"))?;
    let headers = parse_headers(&payload[..position])?;
    Ok((headers, &payload[position + 1..]))
}

fn parse_headers(line: &[u8]) -> Result<MessageHeaders, EncodingError> {
    serde_json::from_slice(line).map_err(|e| EncodingError::malformed(format!("invalid envelope header: {e}")))
}
