//! Writes one message onto a response.

use crate::error::TransportError;
use crate::http_channel::{HttpResponseMessageProperty, HttpResponseSink, StatusDescription};
use crate::settings::HttpTransportSettings;
use crate::utils::ensure;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Method};
use micro_soap::encoder::{CompressionProperty, content_type_for_compression, get_http_response_type_and_encoding_for_compression};
use micro_soap::message::Message;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, trace};

pub struct HttpOutput {
    sink: Box<dyn HttpResponseSink>,
    settings: Arc<HttpTransportSettings>,
    request_method: Method,
    closed: bool,
}

impl HttpOutput {
    pub fn new(sink: Box<dyn HttpResponseSink>, settings: Arc<HttpTransportSettings>, request_method: Method) -> Self {
        Self { sink, settings, request_method, closed: false }
    }

    pub fn is_sent(&self) -> bool {
        self.sink.is_sent()
    }

    /// Serializes `message` onto the response.
    ///
    /// A buffered message is encoded into a pooled buffer whose bytes move into the response body,
    /// the emptied buffer goes back to the pool right away.
    pub async fn send(&mut self, message: &mut Message) -> Result<(), TransportError> {
        ensure!(!self.closed, TransportError::invalid_operation("the output is closed"));
        ensure!(!self.sink.is_sent(), TransportError::invalid_operation("the response has already been sent"));

        if self.prepare_http_send(message)? {
            trace!("sending a response without entity body");
            self.sink.send_buffered(Bytes::new()).await?;
            return Ok(());
        }

        if self.settings.transfer_mode().is_response_streamed() {
            let result = self.send_streamed(message).await;
            if result.is_err() {
                self.sink.abort();
            }
            return result;
        }

        let buffers = self.settings.buffer_manager();
        let mut buffer = self.settings.encoder().write_message(message, self.settings.max_buffer_size(), buffers).await?;
        let body = buffer.split().freeze();
        buffers.return_buffer(buffer);

        self.sink.head_mut().headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.sink.send_buffered(body).await?;
        Ok(())
    }

    async fn send_streamed(&mut self, message: &mut Message) -> Result<(), TransportError> {
        let writer = self.sink.send_streamed().await?;
        let mut writer = BufWriter::new(writer);
        self.settings.encoder().write_message_to(message, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Fills in the response head. Returns true when the response carries no entity body.
    fn prepare_http_send(&mut self, message: &mut Message) -> Result<bool, TransportError> {
        if message.version().addressing().is_none() {
            message.headers_mut().clear_addressing();
        }

        let encoder = self.settings.encoder();
        let property = message.properties().get::<HttpResponseMessageProperty>().cloned();

        let mut content_type = property
            .as_ref()
            .and_then(|property| property.headers.get(CONTENT_TYPE))
            .and_then(|value| value.to_str().ok())
            .filter(|content_type| encoder.is_content_type_supported(content_type))
            .map_or_else(|| encoder.content_type().to_string(), str::to_string);

        let mut content_encoding = None;
        let compression = message.properties().get::<CompressionProperty>().copied();
        if let Some(CompressionProperty(format)) = compression.filter(|_| encoder.compression_enabled()) {
            let compressed = content_type_for_compression(&content_type, format);
            (content_type, content_encoding) = get_http_response_type_and_encoding_for_compression(&compressed);
        }

        let suppress = self.request_method == Method::HEAD
            || property.as_ref().is_some_and(|property| property.suppress_entity_body);

        let head = self.sink.head_mut();
        if let Some(property) = &property {
            *head.status_mut() = property.status;
            if let Some(description) = &property.status_description {
                head.extensions_mut().insert(StatusDescription(description.clone()));
            }
            apply_headers(head.headers_mut(), &property.headers);
        }

        let headers = head.headers_mut();
        if suppress {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
            return Ok(true);
        }

        let content_type = HeaderValue::from_str(&content_type)
            .map_err(|_| TransportError::configuration(format!("invalid response content type `{content_type}`")))?;
        headers.insert(CONTENT_TYPE, content_type);
        if let Some(format) = content_encoding {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(format.name()));
        }
        Ok(false)
    }

    /// Finishes the response, no later send is accepted. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Drops the response, failing a body that is still being written. Idempotent.
    pub fn abort(&mut self) {
        debug!("aborting http output");
        self.closed = true;
        self.sink.abort();
    }
}

impl std::fmt::Debug for HttpOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOutput")
            .field("request_method", &self.request_method)
            .field("sent", &self.sink.is_sent())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Copies reply headers onto the response.
///
/// `Connection` tokens are merged, `close` and `keep-alive` replacing each other.
/// `WWW-Authenticate` replaces what is there. Framing headers are owned by the output.
fn apply_headers(target: &mut HeaderMap, headers: &HeaderMap) {
    for (name, value) in headers {
        if name == CONTENT_TYPE || name == CONTENT_LENGTH {
            continue;
        } else if name == CONNECTION {
            merge_connection(target, value);
        } else if name == WWW_AUTHENTICATE {
            target.insert(WWW_AUTHENTICATE, value.clone());
        } else {
            target.append(name.clone(), value.clone());
        }
    }
}

fn merge_connection(target: &mut HeaderMap, value: &HeaderValue) {
    let mut tokens: Vec<String> = target
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();

    for token in value.to_str().unwrap_or_default().split(',').map(str::trim).filter(|token| !token.is_empty()) {
        let opposite = if token.eq_ignore_ascii_case("close") {
            Some("keep-alive")
        } else if token.eq_ignore_ascii_case("keep-alive") {
            Some("close")
        } else {
            None
        };
        if let Some(opposite) = opposite {
            tokens.retain(|existing| !existing.eq_ignore_ascii_case(opposite));
        }
        if !tokens.iter().any(|existing| existing.eq_ignore_ascii_case(token)) {
            tokens.push(token.to_string());
        }
    }

    if let Ok(value) = HeaderValue::from_str(&tokens.join(", ")) {
        target.insert(CONNECTION, value);
    }
}
