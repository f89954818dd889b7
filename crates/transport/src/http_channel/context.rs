//! One HTTP request/reply exchange.
//!
//! ```text
//! Created -> Authenticating -> MessageReceived -> Replying -> Closed
//!    \____________________________________________________/-> Aborted
//! ```
//!
//! Every response, including the early 400/401/403 answers, goes through the same reply guard,
//! so at most one response is ever written for a request.

use crate::error::TransportError;
use crate::http_channel::{
    Authenticator, HttpInput, HttpOutput, HttpRequestSource, HttpResponseMessageProperty, HttpResponseSink,
    IncomingMessage, SecurityContext, SecurityMessageProperty,
};
use crate::io::EofSignal;
use crate::settings::HttpTransportSettings;
use crate::sync::AtomicTransition;
use crate::utils::ensure;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use micro_soap::encoder::{CompressionFormat, CompressionProperty};
use micro_soap::message::{AddressingVersion, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestContextState {
    Created,
    Authenticating,
    MessageReceived,
    Replying,
    Closed,
    Aborted,
}

type CleanupHook = Box<dyn FnOnce() + Send>;

struct Exchange {
    input: HttpInput,
    output: HttpOutput,
    security: Option<SecurityContext>,
}

pub struct HttpRequestContext {
    settings: Arc<HttpTransportSettings>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    compression: Option<CompressionFormat>,
    eof: EofSignal,
    state: StdMutex<RequestContextState>,
    reply_initiated: AtomicBool,
    cleanup: AtomicTransition,
    cleanup_hook: StdMutex<Option<CleanupHook>>,
    cancel: CancellationToken,
    exchange: Mutex<Exchange>,
}

impl HttpRequestContext {
    pub fn new(
        source: Box<dyn HttpRequestSource>,
        sink: Box<dyn HttpResponseSink>,
        settings: Arc<HttpTransportSettings>,
    ) -> Arc<Self> {
        let method = source.method().clone();
        let uri = source.uri().clone();
        let headers = source.headers().clone();

        let input = HttpInput::new(source, Arc::clone(&settings));
        let output = HttpOutput::new(sink, Arc::clone(&settings), method.clone());
        let compression = input.negotiated_compression();
        let eof = input.eof_signal().clone();

        Arc::new(Self {
            settings,
            method,
            uri,
            headers,
            compression,
            eof,
            state: StdMutex::new(RequestContextState::Created),
            reply_initiated: AtomicBool::new(false),
            cleanup: AtomicTransition::new(),
            cleanup_hook: StdMutex::new(None),
            cancel: CancellationToken::new(),
            exchange: Mutex::new(Exchange { input, output, security: None }),
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn settings(&self) -> &Arc<HttpTransportSettings> {
        &self.settings
    }

    pub fn state(&self) -> RequestContextState {
        self.state.lock().map_or(RequestContextState::Aborted, |state| *state)
    }

    fn set_state(&self, next: RequestContextState) {
        if let Ok(mut state) = self.state.lock() {
            if !matches!(*state, RequestContextState::Closed | RequestContextState::Aborted) {
                *state = next;
            }
        }
    }

    pub fn is_reply_initiated(&self) -> bool {
        self.reply_initiated.load(Ordering::Acquire)
    }

    /// Registers the hook releasing server resources, run once on close or abort.
    pub fn set_cleanup_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
        if let Ok(mut slot) = self.cleanup_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Checks the transport credentials.
    ///
    /// A rejected request has already been answered and closed when this returns false.
    pub async fn process_authentication(&self, authenticator: &dyn Authenticator) -> bool {
        self.set_state(RequestContextState::Authenticating);

        match self.authenticate(authenticator).await {
            Ok(security) => {
                self.exchange.lock().await.security = Some(security);
                true
            }
            Err(e) => {
                let status = match &e {
                    TransportError::AuthenticationFailed { status } | TransportError::Protocol { status, .. } => *status,
                    _ => StatusCode::FORBIDDEN,
                };
                info!(%status, cause = %e, uri = %self.uri, "rejected request");

                let mut headers = HeaderMap::new();
                if status == StatusCode::UNAUTHORIZED
                    && let Some(challenge) = self.settings.authentication_scheme().challenge()
                {
                    headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
                }
                if let Err(e) = self.send_status(status, None, headers).await {
                    debug!(cause = %e, "failed to send the authentication failure");
                }
                false
            }
        }
    }

    async fn authenticate(&self, authenticator: &dyn Authenticator) -> Result<SecurityContext, TransportError> {
        if self.settings.authentication_scheme().challenge().is_some() && !self.headers.contains_key(AUTHORIZATION) {
            return Err(TransportError::AuthenticationFailed { status: StatusCode::UNAUTHORIZED });
        }
        authenticator.authenticate(&self.method, &self.uri, &self.headers).await
    }

    /// Parses the request into a message carrying the security context of the request.
    pub async fn receive_message(&self) -> Result<IncomingMessage, TransportError> {
        let mut exchange = self.exchange.lock().await;
        let mut incoming = exchange.input.parse_incoming_message().await?;

        if self.cancel.is_cancelled() {
            // aborted while parsing, the output could not be reached then
            exchange.output.abort();
            if let Some(message) = incoming.message.as_mut() {
                message.close();
            }
            return Err(TransportError::aborted("the request was aborted"));
        }

        if let (Some(message), Some(context)) = (incoming.message.as_mut(), exchange.security.as_ref()) {
            message.properties_mut().insert(SecurityMessageProperty { context: context.clone() });
        }
        self.set_state(RequestContextState::MessageReceived);
        Ok(incoming)
    }

    /// Sends the reply. Only the first reply of an exchange is accepted.
    ///
    /// `None` acknowledges a one-way request with `202 Accepted` and closes the exchange once the
    /// request body has been read to its end.
    pub async fn reply(self: &Arc<Self>, message: Option<Message>) -> Result<(), TransportError> {
        if !self.begin_reply() {
            return Err(TransportError::invalid_operation("a reply has already been sent for this request"));
        }

        match message {
            Some(message) => self.reply_core(message).await,
            None => {
                self.reply_core(self.acknowledgement(StatusCode::ACCEPTED, None, HeaderMap::new())).await?;
                self.close_on_eof().await
            }
        }
    }

    /// Answers with a bodiless status and closes. Degrades to a plain close when a reply was
    /// already sent.
    pub async fn send_response_and_close(&self, status: StatusCode, description: Option<&str>) -> Result<(), TransportError> {
        self.send_status(status, description, HeaderMap::new()).await
    }

    async fn send_status(&self, status: StatusCode, description: Option<&str>, headers: HeaderMap) -> Result<(), TransportError> {
        if self.begin_reply() {
            self.reply_core(self.acknowledgement(status, description, headers)).await?;
        }
        self.close_core().await
    }

    /// Flushes the output and runs cleanup. A request nobody answered is acknowledged first.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.begin_reply() {
            debug!(uri = %self.uri, "closing without a reply, acknowledging");
            self.reply_core(self.acknowledgement(StatusCode::ACCEPTED, None, HeaderMap::new())).await?;
        }
        self.close_core().await
    }

    /// Tears the exchange down. A reply in flight fails with [`TransportError::Aborted`].
    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            if matches!(*state, RequestContextState::Closed | RequestContextState::Aborted) {
                return;
            }
            *state = RequestContextState::Aborted;
        }

        debug!(uri = %self.uri, "aborting request context");
        self.cancel.cancel();
        // whoever holds the lock aborts the output once it sees the cancellation
        if let Ok(mut exchange) = self.exchange.try_lock() {
            exchange.output.abort();
        }
        self.on_cleanup();
    }

    fn begin_reply(&self) -> bool {
        !self.reply_initiated.swap(true, Ordering::AcqRel)
    }

    async fn reply_core(&self, mut message: Message) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            message.close();
            // takes over the output abort when the abort found the exchange locked
            drop(self.lock_exchange().await);
            return Err(TransportError::aborted("the request was aborted"));
        }

        self.set_state(RequestContextState::Replying);
        self.prepare_reply(&mut message);

        let timeout = self.settings.send_timeout();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::aborted("the request was aborted")),
            result = tokio::time::timeout(timeout, self.send(&mut message)) => {
                result.unwrap_or_else(|_| Err(TransportError::timeout("send", timeout)))
            }
        };
        message.close();

        if let Err(e) = &result {
            warn!(cause = %e, uri = %self.uri, "failed to send the reply");
            self.exchange.lock().await.output.abort();
            self.abort();
        }
        result
    }

    /// Locks the exchange, aborting the output first when the request was aborted meanwhile.
    async fn lock_exchange(&self) -> MutexGuard<'_, Exchange> {
        let mut exchange = self.exchange.lock().await;
        if self.cancel.is_cancelled() {
            exchange.output.abort();
        }
        exchange
    }

    async fn send(&self, message: &mut Message) -> Result<(), TransportError> {
        let mut exchange = self.lock_exchange().await;
        ensure!(!self.cancel.is_cancelled(), TransportError::aborted("the request was aborted"));
        exchange.output.send(message).await
    }

    fn prepare_reply(&self, message: &mut Message) {
        let matcher = self.settings.anonymous_uri_prefix_matcher();
        let addressing = message.version().addressing();
        let to_is_anonymous = message.headers().to.as_deref().is_some_and(|to| matcher.is_anonymous_uri(to));

        match addressing {
            AddressingVersion::WsAddressingAugust2004 => {
                if !to_is_anonymous {
                    message.headers_mut().to = Some(addressing.anonymous_uri().to_string());
                }
            }
            AddressingVersion::WsAddressing10 | AddressingVersion::None => {
                if !to_is_anonymous {
                    message.headers_mut().to = None;
                }
            }
        }

        message.set_allow_output_batching(false);
        if let Some(format) = self.compression
            && !message.properties().contains::<CompressionProperty>()
        {
            message.properties_mut().insert(CompressionProperty(format));
        }
    }

    fn acknowledgement(&self, status: StatusCode, description: Option<&str>, headers: HeaderMap) -> Message {
        let mut property = HttpResponseMessageProperty::new(status).suppress_entity_body();
        property.status_description = description.map(str::to_string);
        property.headers = headers;

        let mut message = Message::empty(self.settings.encoder().message_version());
        message.properties_mut().insert(property);
        message
    }

    async fn close_on_eof(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.eof.is_reached() {
            return self.close_core().await;
        }

        let context = Arc::clone(self);
        let timeout = self.settings.close_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, context.eof.wait()).await {
                Ok(()) => {
                    if let Err(e) = context.close_core().await {
                        debug!(cause = %e, "failed to close after the request body ended");
                    }
                }
                Err(_) => {
                    warn!(?timeout, uri = %context.uri, "request body was not read to its end, aborting");
                    context.abort();
                }
            }
        });
        Ok(())
    }

    async fn close_core(&self) -> Result<(), TransportError> {
        if matches!(self.state(), RequestContextState::Closed | RequestContextState::Aborted) {
            return Ok(());
        }

        self.lock_exchange().await.output.close();
        self.set_state(RequestContextState::Closed);
        self.on_cleanup();
        Ok(())
    }

    fn on_cleanup(&self) {
        if !self.cleanup.try_begin() {
            return;
        }
        let hook = self.cleanup_hook.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
        self.cleanup.finish();
    }
}

impl std::fmt::Debug for HttpRequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequestContext")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("state", &self.state())
            .field("reply_initiated", &self.is_reply_initiated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_channel::auth::MockAuthenticator;
    use crate::http_channel::{AnonymousAuthenticator, HttpRequest, ResponseReceiver, response_channel};
    use crate::settings::{AuthenticationScheme, TransferMode};
    use bytes::Bytes;
    use futures::channel::mpsc;
    use futures::SinkExt;
    use http::Request;
    use http_body::Frame;
    use http_body_util::{BodyExt, Full, StreamBody};
    use micro_soap::buffer::BufferManager;
    use micro_soap::encoder::EnvelopeEncoder;
    use micro_soap::message::{MessageHeaders, MessageVersion};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn settings(version: MessageVersion, scheme: AuthenticationScheme) -> Arc<HttpTransportSettings> {
        HttpTransportSettings::builder()
            .encoder(Arc::new(EnvelopeEncoder::new(version)))
            .buffer_manager(Arc::new(BufferManager::default()))
            .transfer_mode(TransferMode::Buffered)
            .authentication_scheme(scheme)
            .anonymous_uri_prefix("http://anonymous.local/")
            .close_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn context_for(
        request: Request<Full<Bytes>>,
        settings: Arc<HttpTransportSettings>,
    ) -> (Arc<HttpRequestContext>, ResponseReceiver) {
        let (sink, receiver) = response_channel();
        (HttpRequestContext::new(Box::new(HttpRequest::new(request)), Box::new(sink), settings), receiver)
    }

    fn post(body: &'static str) -> Request<Full<Bytes>> {
        Request::post("/svc")
            .header("content-type", "application/soap+msbin1")
            .header("content-length", body.len())
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[tokio::test]
    async fn only_the_first_reply_is_written() {
        let (context, receiver) = context_for(post("{}\nx"), settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Anonymous));
        let cleanups = Arc::new(AtomicUsize::new(0));
        context.set_cleanup_hook({
            let cleanups = Arc::clone(&cleanups);
            move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }
        });

        let reply = Message::buffered(MessageVersion::SOAP12_WSA10, MessageHeaders::new().with_action("urn:r"), "reply");
        let (first, second) = tokio::join!(
            context.reply(Some(reply)),
            context.send_response_and_close(StatusCode::BAD_REQUEST, Some("Bad"))
        );
        assert!(first.is_ok() && second.is_ok());

        let response = receiver.recv().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(context.reply(None).await.is_err());

        context.close().await.unwrap();
        context.abort();
        assert_eq!(context.state(), RequestContextState::Closed);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn anonymous_destination_survives_addressing_normalization() {
        let settings = settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Anonymous);
        let (context, _receiver) = context_for(post("{}\nx"), settings);

        let mut kept = Message::empty(MessageVersion::SOAP12_WSA10);
        kept.headers_mut().to = Some("http://anonymous.local/client/1".into());
        context.prepare_reply(&mut kept);
        assert_eq!(kept.headers().to.as_deref(), Some("http://anonymous.local/client/1"));
        assert!(!kept.allow_output_batching());

        let mut cleared = Message::empty(MessageVersion::SOAP12_WSA10);
        cleared.headers_mut().to = Some("http://elsewhere.example/".into());
        context.prepare_reply(&mut cleared);
        assert_eq!(cleared.headers().to, None);

        let mut august = Message::empty(MessageVersion::SOAP12_WSA_AUGUST_2004);
        august.headers_mut().to = Some("http://elsewhere.example/".into());
        context.prepare_reply(&mut august);
        assert_eq!(august.headers().to.as_deref(), Some(AddressingVersion::WsAddressingAugust2004.anonymous_uri()));
    }

    #[tokio::test]
    async fn missing_credentials_are_challenged() {
        let (context, receiver) = context_for(post("{}\nx"), settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Basic));

        assert!(!context.process_authentication(&AnonymousAuthenticator).await);
        let response = receiver.recv().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Basic realm=\"\"");
        assert_eq!(context.state(), RequestContextState::Closed);
    }

    #[tokio::test]
    async fn rejected_credentials_default_to_forbidden() {
        let mut authenticator = MockAuthenticator::new();
        authenticator
            .expect_authenticate()
            .times(1)
            .returning(|_, _, _| Err(TransportError::communication("directory unavailable")));

        let mut request = post("{}\nx");
        request.headers_mut().insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        let (context, receiver) = context_for(request, settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Basic));

        assert!(!context.process_authentication(&authenticator).await);
        assert_eq!(receiver.recv().await.unwrap().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn security_context_is_attached_to_the_message() {
        let mut authenticator = MockAuthenticator::new();
        authenticator.expect_authenticate().returning(|_, _, _| {
            Ok(SecurityContext { scheme: AuthenticationScheme::Basic, identity: Some("alice".into()) })
        });

        let mut request = post("{\"action\":\"urn:a\"}\nx");
        request.headers_mut().insert(AUTHORIZATION, HeaderValue::from_static("Basic YWxpY2U6cHc="));
        let (context, _receiver) = context_for(request, settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Basic));

        assert!(context.process_authentication(&authenticator).await);
        let message = context.receive_message().await.unwrap().message.unwrap();
        let property = message.properties().get::<SecurityMessageProperty>().unwrap();
        assert_eq!(property.context.identity.as_deref(), Some("alice"));
        assert_eq!(context.state(), RequestContextState::MessageReceived);
    }

    #[tokio::test]
    async fn one_way_reply_closes_after_the_body_is_read() {
        let (mut sender, receiver) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(4);
        let request = Request::post("/svc")
            .header("content-type", "application/soap+msbin1")
            .header("transfer-encoding", "chunked")
            .body(StreamBody::new(receiver))
            .unwrap();
        let settings = HttpTransportSettings::builder()
            .encoder(Arc::new(EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10)))
            .transfer_mode(TransferMode::Streamed)
            .close_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let (sink, responses) = response_channel();
        let context = HttpRequestContext::new(Box::new(HttpRequest::new(request)), Box::new(sink), settings);

        sender.send(Ok(Frame::data(Bytes::from_static(b"{}\nhead")))).await.unwrap();
        let mut message = context.receive_message().await.unwrap().message.unwrap();

        context.reply(None).await.unwrap();
        let response = responses.recv().await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());
        assert_eq!(context.state(), RequestContextState::Replying);

        sender.send(Ok(Frame::data(Bytes::from_static(b" tail")))).await.unwrap();
        drop(sender);
        let body = message.take_body().unwrap().into_bytes(1024).await.unwrap();
        assert_eq!(&body[..], b"head tail");

        tokio::time::timeout(Duration::from_secs(1), async {
            while context.state() != RequestContextState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn abort_while_parsing_is_terminal() {
        let (mut sender, body) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(4);
        let request = Request::post("/svc")
            .header("content-type", "application/soap+msbin1")
            .header("transfer-encoding", "chunked")
            .body(StreamBody::new(body))
            .unwrap();
        let settings = settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Anonymous);
        let (sink, responses) = response_channel();
        let context = HttpRequestContext::new(Box::new(HttpRequest::new(request)), Box::new(sink), Arc::clone(&settings));

        let receiving = tokio::spawn({
            let context = Arc::clone(&context);
            async move { context.receive_message().await }
        });
        sender.send(Ok(Frame::data(Bytes::from_static(b"{}\nhead")))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while context.exchange.try_lock().is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        context.abort();
        sender.send(Ok(Frame::data(Bytes::from_static(b" tail")))).await.unwrap();
        drop(sender);

        let error = receiving.await.unwrap().unwrap_err();
        assert!(matches!(error, TransportError::Aborted { .. }));
        let reply = Message::buffered(MessageVersion::SOAP12_WSA10, MessageHeaders::new(), "late");
        assert!(context.reply(Some(reply)).await.is_err());
        assert!(context.close().await.is_ok());
        assert_eq!(context.state(), RequestContextState::Aborted);
        assert!(responses.recv().await.is_none());
        assert_eq!(settings.buffer_manager().outstanding(), 0);
    }

    #[tokio::test]
    async fn abort_drops_the_response() {
        let (context, receiver) = context_for(post("{}\nx"), settings(MessageVersion::SOAP12_WSA10, AuthenticationScheme::Anonymous));
        context.abort();
        assert_eq!(context.state(), RequestContextState::Aborted);
        assert!(receiver.recv().await.is_none());
        assert!(context.reply(Some(Message::empty(MessageVersion::SOAP12_WSA10))).await.is_err());
    }
}
