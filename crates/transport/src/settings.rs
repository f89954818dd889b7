//! Transport configuration.
//!
//! [`HttpTransportSettings`] is assembled once through its builder, or from a deserialized
//! [`TransportConfig`], and then shared read-only by every exchange behind an `Arc`.

use crate::addressing::AnonymousUriPrefixMatcher;
use crate::error::TransportError;
use crate::utils::ensure;
use crate::websocket::WebSocketMessageType;
use micro_soap::buffer::BufferManager;
use micro_soap::encoder::MessageEncoder;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_RECEIVED_MESSAGE_SIZE: u64 = 64 * 1024;
const DEFAULT_MAX_BUFFER_POOL_SIZE: usize = 512 * 1024;
const DEFAULT_MAX_SIZE_OF_HEADERS: usize = 16 * 1024;
const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Whether request and response bodies are buffered or streamed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    #[default]
    Buffered,
    Streamed,
    StreamedRequest,
    StreamedResponse,
}

impl TransferMode {
    pub fn is_request_streamed(&self) -> bool {
        matches!(self, TransferMode::Streamed | TransferMode::StreamedRequest)
    }

    pub fn is_response_streamed(&self) -> bool {
        matches!(self, TransferMode::Streamed | TransferMode::StreamedResponse)
    }
}

/// When the WebSocket transport is used instead of plain request/reply HTTP.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportUsage {
    Never,
    /// Upgrade requests are accepted, plain requests keep working.
    #[default]
    WhenDuplex,
    /// Plain requests are rejected with `426 Upgrade Required`.
    Always,
}

/// The HTTP authentication scheme required from clients.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationScheme {
    #[default]
    Anonymous,
    Basic,
    Digest,
    Negotiate,
    Ntlm,
}

impl AuthenticationScheme {
    /// The challenge announced through `WWW-Authenticate`.
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            AuthenticationScheme::Anonymous => None,
            AuthenticationScheme::Basic => Some("Basic realm=\"\""),
            AuthenticationScheme::Digest => Some("Digest"),
            AuthenticationScheme::Negotiate => Some("Negotiate"),
            AuthenticationScheme::Ntlm => Some("NTLM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketTransportSettings {
    transport_usage: TransportUsage,
    sub_protocol: Option<String>,
    default_message_type: WebSocketMessageType,
    max_frame_size: usize,
}

impl WebSocketTransportSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport_usage(mut self, transport_usage: TransportUsage) -> Self {
        self.transport_usage = transport_usage;
        self
    }

    pub fn with_sub_protocol<S: Into<String>>(mut self, sub_protocol: S) -> Self {
        self.sub_protocol = Some(sub_protocol.into());
        self
    }

    pub fn with_default_message_type(mut self, message_type: WebSocketMessageType) -> Self {
        self.default_message_type = message_type;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn transport_usage(&self) -> TransportUsage {
        self.transport_usage
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    pub fn default_message_type(&self) -> WebSocketMessageType {
        self.default_message_type
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for WebSocketTransportSettings {
    fn default() -> Self {
        Self {
            transport_usage: TransportUsage::default(),
            sub_protocol: None,
            default_message_type: WebSocketMessageType::Binary,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

pub struct HttpTransportSettings {
    open_timeout: Duration,
    close_timeout: Duration,
    send_timeout: Duration,
    receive_timeout: Duration,
    max_buffer_size: usize,
    max_received_message_size: u64,
    max_size_of_headers: usize,
    transfer_mode: TransferMode,
    keep_alive_enabled: bool,
    authentication_scheme: AuthenticationScheme,
    anonymous_uri_prefix_matcher: AnonymousUriPrefixMatcher,
    web_socket: WebSocketTransportSettings,
    buffer_manager: Arc<BufferManager>,
    encoder: Arc<dyn MessageEncoder>,
}

impl HttpTransportSettings {
    pub fn builder() -> HttpTransportSettingsBuilder {
        HttpTransportSettingsBuilder::new()
    }

    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// Upper bound for a fully buffered message.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    pub fn max_received_message_size(&self) -> u64 {
        self.max_received_message_size
    }

    /// Upper bound for the headers an encoder reads before handing out a streamed body.
    pub fn max_size_of_headers(&self) -> usize {
        self.max_size_of_headers
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    pub fn keep_alive_enabled(&self) -> bool {
        self.keep_alive_enabled
    }

    pub fn authentication_scheme(&self) -> AuthenticationScheme {
        self.authentication_scheme
    }

    pub fn anonymous_uri_prefix_matcher(&self) -> &AnonymousUriPrefixMatcher {
        &self.anonymous_uri_prefix_matcher
    }

    pub fn web_socket(&self) -> &WebSocketTransportSettings {
        &self.web_socket
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    pub fn encoder(&self) -> &Arc<dyn MessageEncoder> {
        &self.encoder
    }
}

impl std::fmt::Debug for HttpTransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransportSettings")
            .field("transfer_mode", &self.transfer_mode)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("max_received_message_size", &self.max_received_message_size)
            .field("authentication_scheme", &self.authentication_scheme)
            .field("web_socket", &self.web_socket)
            .field("encoder", &self.encoder)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct HttpTransportSettingsBuilder {
    open_timeout: Option<Duration>,
    close_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    max_buffer_size: Option<usize>,
    max_received_message_size: Option<u64>,
    max_buffer_pool_size: Option<usize>,
    max_size_of_headers: Option<usize>,
    transfer_mode: TransferMode,
    keep_alive_enabled: Option<bool>,
    extended_protection: bool,
    authentication_scheme: AuthenticationScheme,
    anonymous_uri_prefix_matcher: AnonymousUriPrefixMatcher,
    web_socket: WebSocketTransportSettings,
    buffer_manager: Option<Arc<BufferManager>>,
    encoder: Option<Arc<dyn MessageEncoder>>,
}

impl HttpTransportSettingsBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn encoder(mut self, encoder: Arc<dyn MessageEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Shares an existing pool instead of creating one sized by `max_buffer_pool_size`.
    pub fn buffer_manager(mut self, buffer_manager: Arc<BufferManager>) -> Self {
        self.buffer_manager = Some(buffer_manager);
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = Some(size);
        self
    }

    pub fn max_received_message_size(mut self, size: u64) -> Self {
        self.max_received_message_size = Some(size);
        self
    }

    pub fn max_buffer_pool_size(mut self, size: usize) -> Self {
        self.max_buffer_pool_size = Some(size);
        self
    }

    pub fn max_size_of_headers(mut self, size: usize) -> Self {
        self.max_size_of_headers = Some(size);
        self
    }

    pub fn transfer_mode(mut self, transfer_mode: TransferMode) -> Self {
        self.transfer_mode = transfer_mode;
        self
    }

    pub fn keep_alive_enabled(mut self, enabled: bool) -> Self {
        self.keep_alive_enabled = Some(enabled);
        self
    }

    pub fn extended_protection(mut self, enabled: bool) -> Self {
        self.extended_protection = enabled;
        self
    }

    pub fn authentication_scheme(mut self, scheme: AuthenticationScheme) -> Self {
        self.authentication_scheme = scheme;
        self
    }

    pub fn anonymous_uri_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.anonymous_uri_prefix_matcher.add_prefix(prefix);
        self
    }

    pub fn web_socket(mut self, web_socket: WebSocketTransportSettings) -> Self {
        self.web_socket = web_socket;
        self
    }

    pub fn build(self) -> Result<Arc<HttpTransportSettings>, TransportError> {
        let encoder = self.encoder.ok_or_else(|| TransportError::configuration("encoder must be set"))?;

        ensure!(self.keep_alive_enabled != Some(false), TransportError::unsupported("disabling keep-alive"));
        ensure!(!self.extended_protection, TransportError::unsupported("extended protection"));

        let max_received_message_size = self.max_received_message_size.unwrap_or(DEFAULT_MAX_RECEIVED_MESSAGE_SIZE);
        let max_buffer_size = self
            .max_buffer_size
            .unwrap_or_else(|| usize::try_from(max_received_message_size).unwrap_or(usize::MAX));

        ensure!(
            max_buffer_size as u64 <= max_received_message_size,
            TransportError::configuration(format!(
                "max_buffer_size {max_buffer_size} exceeds max_received_message_size {max_received_message_size}"
            ))
        );
        ensure!(
            self.transfer_mode != TransferMode::Buffered || max_buffer_size as u64 == max_received_message_size,
            TransportError::configuration("buffered transfer requires max_buffer_size == max_received_message_size")
        );
        ensure!(
            self.web_socket.max_frame_size > 0,
            TransportError::configuration("web socket max_frame_size must be positive")
        );

        let buffer_manager = self.buffer_manager.unwrap_or_else(|| {
            Arc::new(BufferManager::new(
                self.max_buffer_pool_size.unwrap_or(DEFAULT_MAX_BUFFER_POOL_SIZE),
                max_buffer_size,
            ))
        });

        Ok(Arc::new(HttpTransportSettings {
            open_timeout: self.open_timeout.unwrap_or(DEFAULT_OPEN_TIMEOUT),
            close_timeout: self.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT),
            send_timeout: self.send_timeout.unwrap_or(DEFAULT_SEND_TIMEOUT),
            receive_timeout: self.receive_timeout.unwrap_or(DEFAULT_RECEIVE_TIMEOUT),
            max_buffer_size,
            max_received_message_size,
            max_size_of_headers: self.max_size_of_headers.unwrap_or(DEFAULT_MAX_SIZE_OF_HEADERS),
            transfer_mode: self.transfer_mode,
            keep_alive_enabled: true,
            authentication_scheme: self.authentication_scheme,
            anonymous_uri_prefix_matcher: self.anonymous_uri_prefix_matcher,
            web_socket: self.web_socket,
            buffer_manager,
            encoder,
        }))
    }
}

/// The deserializable form of the settings, timeouts in milliseconds.
///
/// ```json
/// { "transfer_mode": "streamed", "max_received_message_size": 1048576, "receive_timeout_ms": 30000,
///   "web_socket": { "transport_usage": "always", "sub_protocol": "soap" } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub open_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub receive_timeout_ms: Option<u64>,
    pub max_buffer_size: Option<usize>,
    pub max_received_message_size: Option<u64>,
    pub max_buffer_pool_size: Option<usize>,
    pub max_size_of_headers: Option<usize>,
    pub transfer_mode: Option<TransferMode>,
    pub keep_alive_enabled: Option<bool>,
    pub extended_protection: Option<bool>,
    pub authentication_scheme: Option<AuthenticationScheme>,
    pub anonymous_uri_prefixes: Vec<String>,
    pub web_socket: Option<WebSocketConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketConfig {
    pub transport_usage: Option<TransportUsage>,
    pub sub_protocol: Option<String>,
    pub default_message_type: Option<WebSocketMessageType>,
    pub max_frame_size: Option<usize>,
}

impl TryFrom<TransportConfig> for HttpTransportSettingsBuilder {
    type Error = TransportError;

    /// Validation that needs the encoder happens in [`HttpTransportSettingsBuilder::build`].
    fn try_from(config: TransportConfig) -> Result<Self, Self::Error> {
        ensure!(config.keep_alive_enabled != Some(false), TransportError::unsupported("disabling keep-alive"));
        ensure!(config.extended_protection != Some(true), TransportError::unsupported("extended protection"));

        let mut builder = HttpTransportSettings::builder();
        let millis = Duration::from_millis;

        if let Some(ms) = config.open_timeout_ms {
            builder = builder.open_timeout(millis(ms));
        }
        if let Some(ms) = config.close_timeout_ms {
            builder = builder.close_timeout(millis(ms));
        }
        if let Some(ms) = config.send_timeout_ms {
            builder = builder.send_timeout(millis(ms));
        }
        if let Some(ms) = config.receive_timeout_ms {
            builder = builder.receive_timeout(millis(ms));
        }
        builder.max_buffer_size = config.max_buffer_size;
        builder.max_received_message_size = config.max_received_message_size;
        builder.max_buffer_pool_size = config.max_buffer_pool_size;
        builder.max_size_of_headers = config.max_size_of_headers;
        builder.transfer_mode = config.transfer_mode.unwrap_or_default();
        builder.authentication_scheme = config.authentication_scheme.unwrap_or_default();
        for prefix in config.anonymous_uri_prefixes {
            builder = builder.anonymous_uri_prefix(prefix);
        }

        if let Some(web_socket) = config.web_socket {
            let mut settings = WebSocketTransportSettings::new()
                .with_transport_usage(web_socket.transport_usage.unwrap_or_default())
                .with_default_message_type(web_socket.default_message_type.unwrap_or(WebSocketMessageType::Binary))
                .with_max_frame_size(web_socket.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE));
            if let Some(sub_protocol) = web_socket.sub_protocol {
                settings = settings.with_sub_protocol(sub_protocol);
            }
            builder = builder.web_socket(settings);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_soap::encoder::EnvelopeEncoder;
    use micro_soap::message::MessageVersion;

    fn encoder() -> Arc<dyn MessageEncoder> {
        Arc::new(EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10))
    }

    #[test]
    fn defaults() {
        let settings = HttpTransportSettings::builder().encoder(encoder()).build().unwrap();
        assert_eq!(settings.max_buffer_size() as u64, settings.max_received_message_size());
        assert_eq!(settings.transfer_mode(), TransferMode::Buffered);
        assert_eq!(settings.web_socket().transport_usage(), TransportUsage::WhenDuplex);
        assert!(settings.keep_alive_enabled());
    }

    #[test]
    fn encoder_is_required() {
        assert!(matches!(HttpTransportSettings::builder().build(), Err(TransportError::Configuration { .. })));
    }

    #[test]
    fn buffered_sizes_must_agree() {
        let result = HttpTransportSettings::builder()
            .encoder(encoder())
            .max_buffer_size(1024)
            .max_received_message_size(4096)
            .build();
        assert!(matches!(result, Err(TransportError::Configuration { .. })));

        let settings = HttpTransportSettings::builder()
            .encoder(encoder())
            .transfer_mode(TransferMode::Streamed)
            .max_buffer_size(1024)
            .max_received_message_size(4096)
            .build()
            .unwrap();
        assert_eq!(settings.max_buffer_size(), 1024);
    }

    #[test]
    fn stubbed_features_are_unsupported() {
        let result = HttpTransportSettings::builder().encoder(encoder()).keep_alive_enabled(false).build();
        assert!(matches!(result, Err(TransportError::Unsupported { feature: "disabling keep-alive" })));

        let config: TransportConfig = serde_json::from_str(r#"{ "extended_protection": true }"#).unwrap();
        assert!(matches!(
            HttpTransportSettingsBuilder::try_from(config),
            Err(TransportError::Unsupported { feature: "extended protection" })
        ));
    }

    #[test]
    fn from_config() {
        let config: TransportConfig = serde_json::from_str(
            r#"{
                "transfer_mode": "streamed_request",
                "max_received_message_size": 1048576,
                "max_buffer_size": 65536,
                "receive_timeout_ms": 1500,
                "anonymous_uri_prefixes": ["http://anonymous/"],
                "web_socket": { "transport_usage": "always", "sub_protocol": "soap", "default_message_type": "text" }
            }"#,
        )
        .unwrap();

        let settings = HttpTransportSettingsBuilder::try_from(config).unwrap().encoder(encoder()).build().unwrap();
        assert_eq!(settings.transfer_mode(), TransferMode::StreamedRequest);
        assert_eq!(settings.receive_timeout(), Duration::from_millis(1500));
        assert!(settings.anonymous_uri_prefix_matcher().is_anonymous_uri("http://anonymous/x"));
        assert_eq!(settings.web_socket().transport_usage(), TransportUsage::Always);
        assert_eq!(settings.web_socket().sub_protocol(), Some("soap"));
        assert_eq!(settings.web_socket().default_message_type(), WebSocketMessageType::Text);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<TransportConfig>(r#"{ "max_buffer": 1 }"#).is_err());
    }
}
