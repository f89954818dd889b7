use crate::http_channel::{HttpResponseSink, ResponseHead, ResponseWriter};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, Response, StatusCode};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::io::{CopyToBytes, SinkWriter};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

const STREAMED_BODY_CHANNEL_CAPACITY: usize = 8;

pub struct ResponseBody {
    inner: Kind,
}

enum Kind {
    Once(Option<Bytes>),
    Stream(UnsyncBoxBody<Bytes, io::Error>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { inner: Kind::Once(None) }
    }

    pub fn once(bytes: Bytes) -> Self {
        if bytes.is_empty() { Self::empty() } else { Self { inner: Kind::Once(Some(bytes)) } }
    }

    pub fn stream<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes, Error = io::Error> + Send + 'static,
    {
        Self { inner: Kind::Stream(UnsyncBoxBody::new(body)) }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Kind::Once(bytes) => f.debug_tuple("ResponseBody::Once").field(&bytes.as_ref().map(Bytes::len)).finish(),
            Kind::Stream(_) => f.write_str("ResponseBody::Stream"),
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::once(bytes)
    }
}

impl From<()> for ResponseBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            Kind::Once(bytes) => Poll::Ready(bytes.take().map(|bytes| Ok(Frame::data(bytes)))),
            Kind::Stream(body) => Pin::new(body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Kind::Once(bytes) => bytes.is_none(),
            Kind::Stream(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Kind::Once(None) => SizeHint::with_exact(0),
            Kind::Once(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            Kind::Stream(body) => body.size_hint(),
        }
    }
}

/// A streamed response body fed by an [`HttpOutput`](super::HttpOutput) writer.
///
/// Fails with `ConnectionAborted` once the exchange was aborted, so the host can reset the
/// connection instead of ending the body cleanly.
pub struct ChannelBody {
    receiver: mpsc::Receiver<Bytes>,
    aborted: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl HttpBody for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.aborted.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "response aborted"))));
        }
        self.receiver.poll_next_unpin(cx).map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

impl fmt::Debug for ChannelBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBody").finish_non_exhaustive()
    }
}

/// The reason phrase to put on the status line, stored in the response extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDescription(pub String);

/// Lets a reply choose its HTTP status and headers.
#[derive(Debug, Clone)]
pub struct HttpResponseMessageProperty {
    pub status: StatusCode,
    pub status_description: Option<String>,
    pub headers: HeaderMap,
    pub suppress_entity_body: bool,
}

impl HttpResponseMessageProperty {
    pub fn new(status: StatusCode) -> Self {
        Self { status, status_description: None, headers: HeaderMap::new(), suppress_entity_body: false }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.status_description = Some(description.into());
        self
    }

    pub fn suppress_entity_body(mut self) -> Self {
        self.suppress_entity_body = true;
        self
    }
}

impl Default for HttpResponseMessageProperty {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Creates a response sink whose response is delivered to the paired [`ResponseReceiver`].
pub fn response_channel() -> (ChannelResponseSink, ResponseReceiver) {
    let (sender, receiver) = oneshot::channel();
    let sink = ChannelResponseSink { head: Response::new(()), sender: Some(sender), abort: CancellationToken::new() };
    (sink, ResponseReceiver { receiver })
}

#[derive(Debug)]
pub struct ResponseReceiver {
    receiver: oneshot::Receiver<Response<ResponseBody>>,
}

impl ResponseReceiver {
    /// Waits for the response. `None` when the exchange ended without producing one.
    pub async fn recv(self) -> Option<Response<ResponseBody>> {
        self.receiver.await.ok()
    }
}

pub struct ChannelResponseSink {
    head: ResponseHead,
    sender: Option<oneshot::Sender<Response<ResponseBody>>>,
    abort: CancellationToken,
}

impl fmt::Debug for ChannelResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelResponseSink")
            .field("status", &self.head.status())
            .field("sent", &self.is_sent())
            .finish_non_exhaustive()
    }
}

impl ChannelResponseSink {
    fn send(&mut self, body: ResponseBody) -> io::Result<()> {
        let sender = self
            .sender
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "the response has already been sent"))?;

        let mut response = Response::new(body);
        *response.status_mut() = self.head.status();
        *response.version_mut() = self.head.version();
        *response.headers_mut() = self.head.headers().clone();
        *response.extensions_mut() = self.head.extensions().clone();

        sender.send(response).map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "the response receiver is gone"))
    }
}

#[async_trait]
impl HttpResponseSink for ChannelResponseSink {
    fn head(&self) -> &ResponseHead {
        &self.head
    }

    fn head_mut(&mut self) -> &mut ResponseHead {
        &mut self.head
    }

    async fn send_buffered(&mut self, body: Bytes) -> io::Result<()> {
        self.send(ResponseBody::once(body))
    }

    async fn send_streamed(&mut self) -> io::Result<ResponseWriter> {
        let (sender, receiver) = mpsc::channel(STREAMED_BODY_CHANNEL_CAPACITY);
        let body = ChannelBody { receiver, aborted: Box::pin(self.abort.clone().cancelled_owned()) };
        self.send(ResponseBody::stream(body))?;

        let sink = sender.sink_map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "the response body was dropped"));
        Ok(Box::new(SinkWriter::new(CopyToBytes::new(sink))))
    }

    fn abort(&mut self) {
        debug!(sent = self.is_sent(), "aborting response");
        self.sender.take();
        self.abort.cancel();
    }

    fn is_sent(&self) -> bool {
        self.sender.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::AsyncWriteExt;

    fn check_send<T: Send>() {}

    #[test]
    fn is_send() {
        check_send::<ResponseBody>();
        check_send::<ChannelResponseSink>();
    }

    #[tokio::test]
    async fn buffered_response_carries_the_head() {
        let (mut sink, receiver) = response_channel();
        *sink.head_mut().status_mut() = StatusCode::ACCEPTED;
        sink.head_mut().extensions_mut().insert(StatusDescription("Accepted".into()));
        sink.send_buffered(Bytes::from_static(b"ok")).await.unwrap();
        assert!(sink.is_sent());
        assert!(sink.send_buffered(Bytes::new()).await.is_err());

        let response = receiver.recv().await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.extensions().get::<StatusDescription>(), Some(&StatusDescription("Accepted".into())));
        assert_eq!(&response.into_body().collect().await.unwrap().to_bytes()[..], b"ok");
    }

    #[tokio::test]
    async fn streamed_response_ends_on_shutdown() {
        let (mut sink, receiver) = response_channel();
        let mut writer = sink.send_streamed().await.unwrap();
        let response = receiver.recv().await.unwrap();

        let reader = tokio::spawn(async move { response.into_body().collect().await.map(|body| body.to_bytes()) });
        writer.write_all(b"chunk one, ").await.unwrap();
        writer.write_all(b"chunk two").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(&reader.await.unwrap().unwrap()[..], b"chunk one, chunk two");
    }

    #[tokio::test]
    async fn abort_fails_the_streamed_body() {
        let (mut sink, receiver) = response_channel();
        let _writer = sink.send_streamed().await.unwrap();
        let response = receiver.recv().await.unwrap();
        sink.abort();

        let error = response.into_body().collect().await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn dropped_sink_yields_no_response() {
        let (sink, receiver) = response_channel();
        drop(sink);
        assert!(receiver.recv().await.is_none());
    }
}
