//! A minimal HTTP/1.1 host echoing messages over plain requests and websocket sessions.
//!
//! ```text
//! cargo run --example duplex_echo
//! ```

use bytes::{Bytes, BytesMut};
use http::{Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use micro_soap::encoder::EnvelopeEncoder;
use micro_soap::message::{Message, MessageHeaders, MessageVersion};
use micro_soap_transport::http_channel::{
    HttpRequestContext, HttpTransportHandler, PendingUpgrade, ResponseBody, StatusDescription, make_dispatcher,
    make_duplex_dispatcher,
};
use micro_soap_transport::settings::{HttpTransportSettings, TransferMode, WebSocketTransportSettings};
use micro_soap_transport::websocket::WebSocketTransportDuplexSessionChannel;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const MAX_HEADERS: usize = 64;

async fn echo(context: Arc<HttpRequestContext>, mut message: Message) -> Result<(), micro_soap_transport::error::TransportError> {
    let body = message.take_body()?.into_bytes(64 * 1024).await?;
    let action = message.headers().action.clone().unwrap_or_default();
    let reply = Message::buffered(message.version(), MessageHeaders::new().with_action(format!("{action}Response")), body);
    context.reply(Some(reply)).await
}

async fn echo_session(channel: Arc<WebSocketTransportDuplexSessionChannel>) {
    loop {
        match channel.receive().await {
            Ok(Some(mut message)) => {
                let body = match message.take_body() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(cause = %e, "unreadable message");
                        break;
                    }
                };
                let reply = Message::new(message.version(), MessageHeaders::new(), body);
                if let Err(e) = channel.send(reply).await {
                    warn!(cause = %e, "failed to echo");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(cause = %e, "session failed");
                channel.abort();
                return;
            }
        }
    }
    if let Err(e) = channel.close().await {
        warn!(cause = %e, "failed to close the session");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = HttpTransportSettings::builder()
        .encoder(Arc::new(EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10)))
        .transfer_mode(TransferMode::Buffered)
        .web_socket(WebSocketTransportSettings::new().with_sub_protocol("soap"))
        .build()?;

    let handler = Arc::new(
        HttpTransportHandler::new(settings, Arc::new(make_dispatcher(echo)))
            .with_duplex_dispatcher(Arc::new(make_duplex_dispatcher(echo_session))),
    );

    let listener = TcpListener::bind("127.0.0.1:8080").await?;
    info!("listening on 127.0.0.1:8080");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, remote_addr, handler).await {
                error!(%remote_addr, cause = %e, "connection failed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    handler: Arc<HttpTransportHandler>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let Some(mut request) = read_request(&mut stream, &mut buffer).await? else {
            return Ok(());
        };
        request.extensions_mut().insert(remote_addr);
        let (pending, upgraded) = PendingUpgrade::new();
        request.extensions_mut().insert(pending);

        let response = handler.handle(request).await;
        let switching = response.status() == StatusCode::SWITCHING_PROTOCOLS;
        write_response(&mut stream, response).await?;

        if switching {
            if upgraded.send(Box::new(stream)).is_err() {
                warn!("the upgraded connection was not claimed");
            }
            return Ok(());
        }
    }
}

async fn read_request(stream: &mut TcpStream, buffer: &mut BytesMut) -> Result<Option<Request<Full<Bytes>>>, Box<dyn Error + Send + Sync>> {
    let (head_len, request, content_length) = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(head_len) = parsed.parse(buffer)? {
            let mut builder = Request::builder()
                .method(parsed.method.unwrap_or("GET"))
                .uri(parsed.path.unwrap_or("/"))
                .version(Version::HTTP_11);
            let mut content_length = 0usize;
            for header in parsed.headers.iter() {
                if header.name.eq_ignore_ascii_case("content-length") {
                    content_length = std::str::from_utf8(header.value)?.trim().parse()?;
                }
                builder = builder.header(header.name, header.value);
            }
            break (head_len, builder, content_length);
        }

        if stream.read_buf(buffer).await? == 0 {
            return Ok(None);
        }
    };

    while buffer.len() < head_len + content_length {
        if stream.read_buf(buffer).await? == 0 {
            return Err("connection closed inside a request body".into());
        }
    }

    let mut message = buffer.split_to(head_len + content_length);
    let body = message.split_off(head_len).freeze();
    Ok(Some(request.body(Full::new(body))?))
}

async fn write_response(stream: &mut TcpStream, response: Response<ResponseBody>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    let reason = parts
        .extensions
        .get::<StatusDescription>()
        .map(|description| description.0.clone())
        .or_else(|| parts.status.canonical_reason().map(str::to_string))
        .unwrap_or_default();

    let mut head = format!("HTTP/1.1 {} {reason}\r\n", parts.status.as_u16());
    for (name, value) in &parts.headers {
        head.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or_default()));
    }
    if parts.status != StatusCode::SWITCHING_PROTOCOLS && !parts.headers.contains_key(http::header::CONTENT_LENGTH) {
        head.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}
