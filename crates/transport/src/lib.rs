//! HTTP and websocket transports for micro-soap messages
//!
//! The crate adapts byte oriented connections into discrete [`Message`](micro_soap::message::Message)s
//! with strict lifecycle and error mapping rules:
//!
//! - [`http_channel`]: one message per HTTP request, parsed by [`HttpInput`](http_channel::HttpInput)
//!   (buffered, chunked or streamed), answered at most once through
//!   [`HttpRequestContext`](http_channel::HttpRequestContext) and written by
//!   [`HttpOutput`](http_channel::HttpOutput)
//! - [`websocket`]: a duplex session over an upgraded connection, see
//!   [`WebSocketTransportDuplexSessionChannel`](websocket::WebSocketTransportDuplexSessionChannel)
//! - [`settings`]: the shared [`HttpTransportSettings`](settings::HttpTransportSettings)
//! - [`error`]: the closed set of [`TransportError`](error::TransportError)s every failure maps to
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use micro_soap::encoder::EnvelopeEncoder;
//! use micro_soap::message::{Message, MessageVersion};
//! use micro_soap_transport::http_channel::{make_dispatcher, HttpRequestContext, HttpTransportHandler};
//! use micro_soap_transport::settings::HttpTransportSettings;
//!
//! # fn main() -> Result<(), micro_soap_transport::error::TransportError> {
//! let settings = HttpTransportSettings::builder()
//!     .encoder(Arc::new(EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10)))
//!     .build()?;
//!
//! let echo = make_dispatcher(|context: Arc<HttpRequestContext>, message: Message| async move {
//!     context.reply(Some(message)).await
//! });
//! let handler = HttpTransportHandler::new(settings, Arc::new(echo));
//! // hand every request of the server to `handler.handle(request).await`
//! # let _ = handler;
//! # Ok(())
//! # }
//! ```

pub mod addressing;
pub mod error;
pub mod http_channel;
pub mod io;
pub mod settings;
pub mod sync;
mod utils;
pub mod websocket;
