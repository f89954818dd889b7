//! What the HTTP pipeline needs from the host server.
//!
//! [`HttpInput`](super::HttpInput), [`HttpOutput`](super::HttpOutput) and
//! [`HttpRequestContext`](super::HttpRequestContext) only talk to the server through these two
//! traits. [`HttpRequest`](super::HttpRequest) and [`ChannelResponseSink`](super::ChannelResponseSink)
//! implement them on top of the `http` crate types.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, Response, Uri};
use micro_soap::message::BodyStream;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWrite;

/// Status, headers and extensions of a response that has not been sent yet.
pub type ResponseHead = Response<()>;

/// A writable body, closed through `shutdown`.
pub type ResponseWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub trait HttpRequestSource: Send {
    fn method(&self) -> &Method;

    fn uri(&self) -> &Uri;

    fn headers(&self) -> &HeaderMap;

    /// The declared body length, `None` when the body is chunked or the header is unusable.
    fn content_length(&self) -> Option<u64> {
        self.headers().get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
    }

    fn content_type(&self) -> Option<&str> {
        self.headers().get(CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }

    /// Whether a body may follow the head.
    fn has_content(&self) -> bool {
        match self.content_length() {
            Some(length) => length > 0,
            None => self.headers().contains_key(http::header::TRANSFER_ENCODING),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Hands out the request body. Called at most once.
    fn open_body(&mut self) -> io::Result<BodyStream>;
}

#[async_trait]
pub trait HttpResponseSink: Send {
    fn head(&self) -> &ResponseHead;

    fn head_mut(&mut self) -> &mut ResponseHead;

    /// Sends the head with a complete body.
    async fn send_buffered(&mut self, body: Bytes) -> io::Result<()>;

    /// Sends the head and returns a writer for the body.
    async fn send_streamed(&mut self) -> io::Result<ResponseWriter>;

    /// Drops the response, failing a body that is still being written.
    fn abort(&mut self);

    fn is_sent(&self) -> bool;
}
