use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use futures::stream;
use http::Request;
use http_body::Frame;
use http_body_util::{Full, StreamBody};
use micro_soap::encoder::EnvelopeEncoder;
use micro_soap::message::MessageVersion;
use micro_soap_transport::http_channel::{HttpInput, HttpRequest, HttpRequestSource};
use micro_soap_transport::settings::{HttpTransportSettings, TransferMode};
use std::hint::black_box;
use std::io;
use std::sync::Arc;
use tokio::runtime::Runtime;

const CONTENT_TYPE: &str = "application/soap+msbin1";

fn payload(body_len: usize) -> Bytes {
    let mut payload = b"{\"action\":\"urn:bench\"}\n".to_vec();
    payload.resize(payload.len() + body_len, b'x');
    Bytes::from(payload)
}

fn settings(transfer_mode: TransferMode) -> Arc<HttpTransportSettings> {
    HttpTransportSettings::builder()
        .encoder(Arc::new(EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10)))
        .max_buffer_size(1024 * 1024)
        .max_received_message_size(1024 * 1024)
        .transfer_mode(transfer_mode)
        .build()
        .unwrap()
}

fn fixed_request(payload: &Bytes) -> Box<dyn HttpRequestSource> {
    let request = Request::post("/svc")
        .header("content-type", CONTENT_TYPE)
        .header("content-length", payload.len())
        .body(Full::new(payload.clone()))
        .unwrap();
    Box::new(HttpRequest::new(request))
}

fn chunked_request(payload: &Bytes) -> Box<dyn HttpRequestSource> {
    let frames: Vec<Result<Frame<Bytes>, io::Error>> =
        payload.chunks(8 * 1024).map(|chunk| Ok(Frame::data(payload.slice_ref(chunk)))).collect();
    let request = Request::post("/svc")
        .header("content-type", CONTENT_TYPE)
        .header("transfer-encoding", "chunked")
        .body(StreamBody::new(stream::iter(frames)))
        .unwrap();
    Box::new(HttpRequest::new(request))
}

fn bench_http_input(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let payload = payload(64 * 1024);
    let buffered = settings(TransferMode::Buffered);
    let streamed = settings(TransferMode::Streamed);

    c.bench_function("parse_known_length_request", |b| {
        b.to_async(&runtime).iter(|| {
            let mut input = HttpInput::new(fixed_request(&payload), Arc::clone(&buffered));
            async move { black_box(input.parse_incoming_message().await.unwrap()) }
        });
    });

    c.bench_function("parse_chunked_request", |b| {
        b.to_async(&runtime).iter(|| {
            let mut input = HttpInput::new(chunked_request(&payload), Arc::clone(&buffered));
            async move { black_box(input.parse_incoming_message().await.unwrap()) }
        });
    });

    c.bench_function("parse_streamed_request", |b| {
        b.to_async(&runtime).iter(|| {
            let mut input = HttpInput::new(chunked_request(&payload), Arc::clone(&streamed));
            async move {
                let mut message = input.parse_incoming_message().await.unwrap().message.unwrap();
                black_box(message.take_body().unwrap().into_bytes(1024 * 1024).await.unwrap())
            }
        });
    });
}

criterion_group!(benches, bench_http_input);
criterion_main!(benches);
