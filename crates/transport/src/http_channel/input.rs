//! Turns a request body into one message.

use crate::addressing::transport_action;
use crate::error::TransportError;
use crate::http_channel::{HttpRequestMessageProperty, HttpRequestSource, RemoteEndpointMessageProperty};
use crate::io::{EofDetectingStream, EofSignal, MaxMessageSizeStream};
use crate::settings::HttpTransportSettings;
use bytes::BytesMut;
use http::StatusCode;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, HOST};
use micro_soap::buffer::BufferManager;
use micro_soap::encoder::{CompressionFormat, CompressionProperty, MessageEncoder, content_type_for_compression};
use micro_soap::message::{BodyStream, Message};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

const INITIAL_CHUNKED_BUFFER_SIZE: usize = 4096;

/// The outcome of parsing a request.
///
/// A fault next to a message is not fatal: the message was decoded, but the transport headers
/// disagree with it. Callers decide whether to reject it and close the message either way.
/// Both fields are `None` when the request had no content and the message version has no notion
/// of an empty message.
#[derive(Debug, Default)]
pub struct IncomingMessage {
    pub message: Option<Message>,
    pub fault: Option<TransportError>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InputStreamState {
    NotOpened,
    Taken,
    Failed,
    Closed,
}

pub struct HttpInput {
    source: Box<dyn HttpRequestSource>,
    settings: Arc<HttpTransportSettings>,
    state: InputStreamState,
    eof: EofSignal,
}

impl HttpInput {
    pub fn new(source: Box<dyn HttpRequestSource>, settings: Arc<HttpTransportSettings>) -> Self {
        Self { source, settings, state: InputStreamState::NotOpened, eof: EofSignal::new() }
    }

    pub fn source(&self) -> &dyn HttpRequestSource {
        &*self.source
    }

    /// Reached once the request body has been read to its end.
    pub fn eof_signal(&self) -> &EofSignal {
        &self.eof
    }

    /// The compression the client accepts for the reply, when the encoder supports it.
    pub fn negotiated_compression(&self) -> Option<CompressionFormat> {
        if !self.settings.encoder().compression_enabled() {
            return None;
        }
        let accept_encoding = self.source.headers().get(ACCEPT_ENCODING)?.to_str().ok()?;
        CompressionFormat::select(accept_encoding)
    }

    /// Opens the request body once.
    ///
    /// After a failed open, `throw_on_error == false` yields `Ok(None)` without trying again so
    /// error handling can carry on.
    pub fn get_input_stream(&mut self, throw_on_error: bool) -> Result<Option<BodyStream>, TransportError> {
        match self.state {
            InputStreamState::NotOpened => {}
            InputStreamState::Failed if !throw_on_error => return Ok(None),
            InputStreamState::Failed => return Err(TransportError::communication("the request body could not be opened")),
            InputStreamState::Taken | InputStreamState::Closed if !throw_on_error => return Ok(None),
            InputStreamState::Taken | InputStreamState::Closed => {
                return Err(TransportError::invalid_operation("the request body is no longer available"));
            }
        }

        match self.source.open_body() {
            Ok(body) => {
                self.state = InputStreamState::Taken;
                Ok(Some(Box::pin(EofDetectingStream::new(body, self.eof.clone()))))
            }
            Err(e) => {
                self.state = InputStreamState::Failed;
                warn!(cause = %e, "failed to open the request body");
                if throw_on_error { Err(TransportError::from_io(e)) } else { Ok(None) }
            }
        }
    }

    pub fn close(&mut self) {
        if self.state == InputStreamState::NotOpened {
            self.state = InputStreamState::Closed;
        }
    }

    /// Decodes the request into a message. The input is closed when this fails.
    pub async fn parse_incoming_message(&mut self) -> Result<IncomingMessage, TransportError> {
        let result = self.parse_core().await;
        if let Err(e) = &result {
            debug!(cause = %e, "failed to parse the incoming message");
            self.close();
        }
        result
    }

    async fn parse_core(&mut self) -> Result<IncomingMessage, TransportError> {
        let encoder = Arc::clone(self.settings.encoder());

        if !self.source.has_content() {
            self.eof.mark();
            if !encoder.message_version().is_none() {
                return Ok(IncomingMessage::default());
            }
            let mut message = Message::empty(encoder.message_version());
            self.add_properties(&mut message);
            return Ok(IncomingMessage { message: Some(message), fault: None });
        }

        let content_type = self.content_type_for_read();
        validate_content_type(&*encoder, content_type.as_deref())?;

        let mut message = if self.settings.transfer_mode().is_request_streamed() {
            self.read_streamed_message(&*encoder, content_type.as_deref()).await?
        } else {
            match self.source.content_length() {
                Some(length) => self.read_buffered_message(&*encoder, length, content_type.as_deref()).await?,
                None => self.read_chunked_message(&*encoder, content_type.as_deref()).await?,
            }
        };

        self.add_properties(&mut message);
        let fault = self.reconcile_addressing(&mut message, content_type.as_deref());
        Ok(IncomingMessage { message: Some(message), fault })
    }

    /// The request content type, with the `Content-Encoding` folded into it for compressing encoders.
    fn content_type_for_read(&self) -> Option<String> {
        let content_type = self.source.content_type()?.to_string();
        if !self.settings.encoder().compression_enabled() {
            return Some(content_type);
        }

        let encoding = self
            .source
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<CompressionFormat>().ok());
        match encoding {
            Some(format) => Some(content_type_for_compression(&content_type, format)),
            None => Some(content_type),
        }
    }

    fn open_for_read(&mut self) -> Result<BodyStream, TransportError> {
        self.get_input_stream(true)?
            .ok_or_else(|| TransportError::communication("the request body is not available"))
    }

    async fn read_streamed_message(
        &mut self,
        encoder: &dyn MessageEncoder,
        content_type: Option<&str>,
    ) -> Result<Message, TransportError> {
        let limit = self.settings.max_received_message_size();
        if self.source.content_length().is_some_and(|length| length > limit) {
            return Err(TransportError::quota_exceeded(limit));
        }

        let body = MaxMessageSizeStream::new(self.open_for_read()?, limit);
        Ok(encoder.read_message_stream(Box::pin(body), self.settings.max_size_of_headers(), content_type).await?)
    }

    async fn read_buffered_message(
        &mut self,
        encoder: &dyn MessageEncoder,
        length: u64,
        content_type: Option<&str>,
    ) -> Result<Message, TransportError> {
        let max = self.settings.max_buffer_size();
        if length > max as u64 {
            return Err(TransportError::quota_exceeded(max as u64));
        }

        let mut body = self.open_for_read()?;
        let buffers = Arc::clone(self.settings.buffer_manager());
        let mut buffer = buffers.take_buffer(length as usize);

        match read_to_fill(&mut body, &mut buffer).await {
            Ok(read) if read == buffer.len() => {}
            Ok(read) => {
                buffers.return_buffer(buffer);
                return Err(TransportError::protocol(
                    StatusCode::BAD_REQUEST,
                    format!("the request body ended after {read} of the {length} bytes announced by Content-Length"),
                ));
            }
            Err(e) => {
                buffers.return_buffer(buffer);
                return Err(TransportError::from_io(e));
            }
        }

        trace!(length, "read buffered request body");
        self.eof.mark();
        Ok(encoder.read_message(buffer, &buffers, content_type)?)
    }

    async fn read_chunked_message(
        &mut self,
        encoder: &dyn MessageEncoder,
        content_type: Option<&str>,
    ) -> Result<Message, TransportError> {
        let mut body = self.open_for_read()?;
        let buffers = Arc::clone(self.settings.buffer_manager());
        let max = self.settings.max_buffer_size();
        let mut buffer = buffers.take_buffer(INITIAL_CHUNKED_BUFFER_SIZE.min(max));

        match read_growing(&mut body, &mut buffer, &buffers, max).await {
            Ok(()) => {
                trace!(length = buffer.len(), "read chunked request body");
                Ok(encoder.read_message(buffer, &buffers, content_type)?)
            }
            Err(e) => {
                buffers.return_buffer(buffer);
                Err(e)
            }
        }
    }

    fn add_properties(&self, message: &mut Message) {
        message.set_via(self.request_uri());
        message.properties_mut().insert(HttpRequestMessageProperty::from_source(&*self.source));
        if let Some(address) = self.source.remote_addr() {
            message.properties_mut().insert(RemoteEndpointMessageProperty { address });
        }
        if let Some(format) = self.negotiated_compression() {
            message.properties_mut().insert(CompressionProperty(format));
        }
    }

    /// The absolute request uri, rebuilt from the `Host` header when the request line was relative.
    fn request_uri(&self) -> String {
        let uri = self.source.uri();
        if uri.scheme().is_some() {
            return uri.to_string();
        }

        let host = self.source.headers().get(HOST).and_then(|value| value.to_str().ok());
        let path = uri.path_and_query().map_or("/", |path| path.as_str());
        match host {
            Some(host) => format!("http://{host}{path}"),
            None => path.to_string(),
        }
    }

    fn reconcile_addressing(&self, message: &mut Message, content_type: Option<&str>) -> Option<TransportError> {
        let version = message.version();
        let action = transport_action(self.source.headers(), version.envelope(), content_type);

        if version.addressing().is_none() {
            let headers = message.headers();
            let on_wire = [
                ("Action", headers.action.is_some()),
                ("To", headers.to.is_some()),
                ("ReplyTo", headers.reply_to.is_some()),
                ("MessageID", headers.message_id.is_some()),
                ("RelatesTo", headers.relates_to.is_some()),
            ]
            .into_iter()
            .find_map(|(header, present)| present.then_some(header));

            if action.is_some() {
                message.headers_mut().action = action;
            }
            message.headers_mut().to = Some(self.request_uri());
            return on_wire.map(|header| TransportError::AddressingHeaderOnWire { header });
        }

        match (action, message.headers().action.as_deref()) {
            (Some(transport), Some(action)) if transport != action => {
                Some(TransportError::ActionMismatch { transport, message: action.to_string() })
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for HttpInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpInput")
            .field("method", self.source.method())
            .field("uri", self.source.uri())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn validate_content_type(encoder: &dyn MessageEncoder, content_type: Option<&str>) -> Result<(), TransportError> {
    let Some(content_type) = content_type else {
        return Err(TransportError::protocol_with_reason(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Missing Content Type"));
    };

    if !encoder.is_content_type_supported(content_type) {
        return Err(TransportError::protocol_with_reason(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!(
                "Cannot process the message because the content type '{content_type}' was not the expected type '{}'.",
                encoder.content_type()
            ),
        ));
    }
    Ok(())
}

/// Reads until `buffer` is full or the stream ends, returning the number of bytes read.
async fn read_to_fill<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Reads the whole stream into `buffer`, doubling it up to `max` bytes.
///
/// A full buffer at `max` is probed for one more byte so an oversized body fails instead of
/// being truncated.
async fn read_growing<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buffer: &mut BytesMut,
    buffers: &BufferManager,
    max: usize,
) -> Result<(), TransportError> {
    let mut filled = 0;
    loop {
        if filled == buffer.len() {
            if buffer.len() >= max {
                let mut probe = [0u8; 1];
                if reader.read(&mut probe).await? == 0 {
                    break;
                }
                return Err(TransportError::quota_exceeded(max as u64));
            }

            let mut grown = buffers.take_buffer((buffer.len() * 2).max(1).min(max));
            grown[..filled].copy_from_slice(&buffer[..filled]);
            buffers.return_buffer(std::mem::replace(buffer, grown));
        }

        match reader.read(&mut buffer[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }

    buffer.truncate(filled);
    Ok(())
}
