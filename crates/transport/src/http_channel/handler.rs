//! The entry point a host server calls for every request.
//!
//! [`HttpTransportHandler::handle`] either runs the request/reply pipeline (authenticate, parse,
//! dispatch, reply, close) or accepts a websocket upgrade and hands the resulting duplex channel
//! to a [`DuplexDispatcher`].

use crate::error::TransportError;
use crate::http_channel::{
    AnonymousAuthenticator, Authenticator, HttpRequest, HttpRequestContext, ResponseBody, StatusDescription,
    response_channel,
};
use crate::settings::{HttpTransportSettings, TransportUsage};
use crate::websocket::{FramedWebSocket, WebSocket, WebSocketTransportDuplexSessionChannel, WebSocketUpgrade};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::UPGRADE;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body::Body;
use micro_soap::message::Message;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Runs the service behind a received message.
///
/// The dispatcher owns the reply: it calls [`HttpRequestContext::reply`], or leaves the request
/// to be acknowledged when the pipeline closes the context.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, context: Arc<HttpRequestContext>, message: Message) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub struct DispatcherFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Dispatcher for DispatcherFn<F>
where
    F: Fn(Arc<HttpRequestContext>, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TransportError>> + Send,
{
    async fn dispatch(&self, context: Arc<HttpRequestContext>, message: Message) -> Result<(), TransportError> {
        (self.f)(context, message).await
    }
}

pub fn make_dispatcher<F, Fut>(f: F) -> DispatcherFn<F>
where
    F: Fn(Arc<HttpRequestContext>, Message) -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    DispatcherFn { f }
}

/// Serves an accepted websocket session until it ends.
#[async_trait]
pub trait DuplexDispatcher: Send + Sync {
    async fn dispatch_session(&self, channel: Arc<WebSocketTransportDuplexSessionChannel>);
}

#[derive(Debug)]
pub struct DuplexDispatcherFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> DuplexDispatcher for DuplexDispatcherFn<F>
where
    F: Fn(Arc<WebSocketTransportDuplexSessionChannel>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn dispatch_session(&self, channel: Arc<WebSocketTransportDuplexSessionChannel>) {
        (self.f)(channel).await
    }
}

pub fn make_duplex_dispatcher<F, Fut>(f: F) -> DuplexDispatcherFn<F>
where
    F: Fn(Arc<WebSocketTransportDuplexSessionChannel>) -> Fut,
    Fut: Future<Output = ()>,
{
    DuplexDispatcherFn { f }
}

/// The raw connection handed over once the `101 Switching Protocols` response went out.
pub trait UpgradedStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpgradedStream for T {}

/// Put into the request extensions by a host able to upgrade the connection.
///
/// The host keeps the sender and completes it with the connection after writing the response.
#[derive(Clone)]
pub struct PendingUpgrade {
    receiver: Arc<Mutex<Option<oneshot::Receiver<Box<dyn UpgradedStream>>>>>,
}

impl PendingUpgrade {
    pub fn new() -> (Self, oneshot::Sender<Box<dyn UpgradedStream>>) {
        let (sender, receiver) = oneshot::channel();
        (Self { receiver: Arc::new(Mutex::new(Some(receiver))) }, sender)
    }

    fn take(&self) -> Option<oneshot::Receiver<Box<dyn UpgradedStream>>> {
        self.receiver.lock().ok()?.take()
    }
}

impl std::fmt::Debug for PendingUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingUpgrade").finish_non_exhaustive()
    }
}

pub struct HttpTransportHandler {
    settings: Arc<HttpTransportSettings>,
    dispatcher: Arc<dyn Dispatcher>,
    duplex: Option<Arc<dyn DuplexDispatcher>>,
    authenticator: Arc<dyn Authenticator>,
}

impl HttpTransportHandler {
    pub fn new(settings: Arc<HttpTransportSettings>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { settings, dispatcher, duplex: None, authenticator: Arc::new(AnonymousAuthenticator) }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Enables websocket upgrades, subject to the configured transport usage.
    pub fn with_duplex_dispatcher(mut self, duplex: Arc<dyn DuplexDispatcher>) -> Self {
        self.duplex = Some(duplex);
        self
    }

    pub fn settings(&self) -> &Arc<HttpTransportSettings> {
        &self.settings
    }

    /// Handles one request and returns its response.
    ///
    /// A `SocketAddr` found in the request extensions becomes the remote endpoint of the message.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let usage = self.settings.web_socket().transport_usage();
        if usage != TransportUsage::Never && self.duplex.is_some() && WebSocketUpgrade::is_upgrade_request(request.headers()) {
            return self.handle_upgrade(request);
        }
        if usage == TransportUsage::Always {
            let mut response = status_response(StatusCode::UPGRADE_REQUIRED, None);
            response.headers_mut().insert(UPGRADE, HeaderValue::from_static("websocket"));
            return response;
        }

        let remote_addr = request.extensions().get::<SocketAddr>().copied();
        let mut source = HttpRequest::new(request);
        if let Some(remote_addr) = remote_addr {
            source = source.with_remote_addr(remote_addr);
        }

        let (sink, receiver) = response_channel();
        let context = HttpRequestContext::new(Box::new(source), Box::new(sink), Arc::clone(&self.settings));
        let span = info_span!("request", method = %context.method(), uri = %context.uri());
        tokio::spawn(
            process_request(context, Arc::clone(&self.dispatcher), Arc::clone(&self.authenticator)).instrument(span),
        );

        match receiver.recv().await {
            Some(response) => response,
            None => status_response(StatusCode::INTERNAL_SERVER_ERROR, None),
        }
    }

    fn handle_upgrade<B>(&self, request: Request<B>) -> Response<ResponseBody> {
        let Some(duplex) = self.duplex.clone() else {
            return status_response(StatusCode::NOT_IMPLEMENTED, None);
        };

        let negotiated =
            WebSocketUpgrade::negotiate(request.method(), request.uri(), request.headers(), self.settings.web_socket());
        let upgrade = match negotiated {
            Ok(upgrade) => upgrade,
            Err(e) => {
                info!(cause = %e, "rejected websocket upgrade");
                return error_response(&e);
            }
        };

        let Some(pending) = request.extensions().get::<PendingUpgrade>().and_then(PendingUpgrade::take) else {
            warn!("websocket upgrade requested on a connection that can't be upgraded");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, None);
        };

        let (response, context) = match upgrade.accept() {
            Ok(accepted) => accepted,
            Err(e) => return error_response(&e),
        };

        let settings = Arc::clone(&self.settings);
        let span = info_span!("websocket", uri = %context.request_uri());
        tokio::spawn(
            async move {
                let open_timeout = settings.open_timeout();
                let io = match tokio::time::timeout(open_timeout, pending).await {
                    Ok(Ok(io)) => io,
                    Ok(Err(_)) => {
                        debug!("the host dropped the upgrade");
                        return;
                    }
                    Err(_) => {
                        warn!(?open_timeout, "the upgraded connection never arrived");
                        return;
                    }
                };

                let socket = Arc::new(FramedWebSocket::server(io, settings.web_socket().max_frame_size())) as Arc<dyn WebSocket>;
                let channel = Arc::new(WebSocketTransportDuplexSessionChannel::new(socket, settings, Some(context)));
                info!("websocket session opened");
                duplex.dispatch_session(channel).await;
            }
            .instrument(span),
        );

        response
    }
}

impl std::fmt::Debug for HttpTransportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransportHandler")
            .field("settings", &self.settings)
            .field("duplex", &self.duplex.is_some())
            .finish_non_exhaustive()
    }
}

async fn process_request(context: Arc<HttpRequestContext>, dispatcher: Arc<dyn Dispatcher>, authenticator: Arc<dyn Authenticator>) {
    if !context.process_authentication(&*authenticator).await {
        return;
    }

    let incoming = match context.receive_message().await {
        Ok(incoming) => incoming,
        Err(e) => {
            info!(cause = %e, "failed to read the request");
            let status = e.status_code();
            if let Err(e) = context.send_response_and_close(status, e.reason()).await {
                debug!(cause = %e, "failed to answer the bad request");
            }
            return;
        }
    };

    let Some(mut message) = incoming.message else {
        if let Err(e) = context.send_response_and_close(StatusCode::BAD_REQUEST, None).await {
            debug!(cause = %e, "failed to answer the empty request");
        }
        return;
    };
    if let Some(fault) = incoming.fault {
        info!(cause = %fault, "rejected the request message");
        message.close();
        if let Err(e) = context.send_response_and_close(fault.status_code(), fault.reason()).await {
            debug!(cause = %e, "failed to answer the rejected message");
        }
        return;
    }

    if let Err(e) = dispatcher.dispatch(Arc::clone(&context), message).await {
        error!(cause = %e, "dispatch failed");
        if let Err(e) = context.send_response_and_close(e.status_code(), None).await {
            debug!(cause = %e, "failed to answer the failed dispatch");
        }
        return;
    }
    if let Err(e) = context.close().await {
        debug!(cause = %e, "failed to close the request context");
    }
}

fn status_response(status: StatusCode, description: Option<&str>) -> Response<ResponseBody> {
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = status;
    if let Some(description) = description {
        response.extensions_mut().insert(StatusDescription(description.to_string()));
    }
    response
}

fn error_response(e: &TransportError) -> Response<ResponseBody> {
    status_response(e.status_code(), e.reason())
}
