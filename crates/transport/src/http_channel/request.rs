use crate::http_channel::HttpRequestSource;
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::TRANSFER_ENCODING;
use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri};
use http_body::Body;
use http_body_util::BodyExt;
use micro_soap::message::BodyStream;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use tokio_util::io::StreamReader;

/// Adapts an `http::Request` to [`HttpRequestSource`].
pub struct HttpRequest<B> {
    head: Parts,
    body: Option<B>,
    // known before the body is handed out, for heads without any framing header
    body_is_empty: bool,
    remote_addr: Option<SocketAddr>,
}

impl<B: Body> HttpRequest<B> {
    pub fn new(request: Request<B>) -> Self {
        let (head, body) = request.into_parts();
        let body_is_empty = body.is_end_stream() || body.size_hint().upper() == Some(0);
        Self { head, body: Some(body), body_is_empty, remote_addr: None }
    }
}

impl<B> HttpRequest<B> {

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.head.extensions
    }
}

impl<B> std::fmt::Debug for HttpRequest<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl<B> HttpRequestSource for HttpRequest<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    fn method(&self) -> &Method {
        &self.head.method
    }

    fn uri(&self) -> &Uri {
        &self.head.uri
    }

    fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    fn has_content(&self) -> bool {
        match self.content_length() {
            Some(length) => length > 0,
            None if self.head.headers.contains_key(TRANSFER_ENCODING) => true,
            None => !self.body_is_empty,
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn open_body(&mut self) -> io::Result<BodyStream> {
        let body = self.body.take().ok_or_else(|| io::Error::other("request body has already been opened"))?;
        let stream = body.into_data_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

/// The request line and headers, recorded on every message received over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRequestMessageProperty {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub suppress_entity_body: bool,
}

impl HttpRequestMessageProperty {
    pub fn from_source(source: &dyn HttpRequestSource) -> Self {
        Self {
            method: source.method().clone(),
            headers: source.headers().clone(),
            query: source.uri().query().map(str::to_string),
            suppress_entity_body: !source.has_content(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEndpointMessageProperty {
    pub address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http_body_util::{Full, StreamBody};
    use http_body::Frame;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn body_is_opened_once() {
        let request = Request::post("/svc?wsdl").header("content-length", "5").body(Full::new(Bytes::from_static(b"hello"))).unwrap();
        let mut request = HttpRequest::new(request);
        assert_eq!(request.content_length(), Some(5));
        assert!(request.has_content());

        let property = HttpRequestMessageProperty::from_source(&request);
        assert_eq!(property.query.as_deref(), Some("wsdl"));
        assert!(!property.suppress_entity_body);

        let mut body = request.open_body().unwrap();
        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
        assert!(request.open_body().is_err());
    }

    #[tokio::test]
    async fn body_errors_surface_as_io_errors() {
        let chunks: Vec<Result<Frame<Bytes>, io::Error>> =
            vec![Ok(Frame::data(Bytes::from_static(b"ab"))), Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))];
        let body = StreamBody::new(stream::iter(chunks));
        let mut request = HttpRequest::new(Request::post("/").header("transfer-encoding", "chunked").body(body).unwrap());
        assert_eq!(request.content_length(), None);
        assert!(request.has_content());

        let mut out = Vec::new();
        let error = request.open_body().unwrap().read_to_end(&mut out).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn unframed_body_is_judged_by_the_body_itself() {
        let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![Ok(Frame::data(Bytes::from_static(b"{}\nx")))];
        let streamed = HttpRequest::new(Request::post("/").body(StreamBody::new(stream::iter(frames))).unwrap());
        assert_eq!(streamed.content_length(), None);
        assert!(streamed.has_content());

        let full = HttpRequest::new(Request::post("/").body(Full::new(Bytes::from_static(b"abc"))).unwrap());
        assert!(full.has_content());

        let empty = HttpRequest::new(Request::post("/").body(Full::new(Bytes::new())).unwrap());
        assert!(!empty.has_content());

        let declared_empty =
            HttpRequest::new(Request::post("/").header("content-length", "0").body(Full::new(Bytes::new())).unwrap());
        assert!(!declared_empty.has_content());
    }
}
