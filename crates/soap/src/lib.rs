//! The message layer shared by the micro-soap transports
//!
//! This crate holds everything a transport needs to know about a message without knowing how
//! the bytes travel:
//!
//! - [`message`]: the [`Message`](message::Message) model, its addressing headers, a typed
//!   property bag and the message / addressing versions
//! - [`encoder`]: the [`MessageEncoder`](encoder::MessageEncoder) contract, binary content types,
//!   gzip / deflate payload compression and a compact [`EnvelopeEncoder`](encoder::EnvelopeEncoder)
//! - [`buffer`]: a pooled [`BufferManager`](buffer::BufferManager)
//!
//! # Example
//!
//! ```
//! use micro_soap::buffer::BufferManager;
//! use micro_soap::encoder::{EnvelopeEncoder, MessageEncoder};
//! use micro_soap::message::{Message, MessageHeaders, MessageVersion};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), micro_soap::error::EncodingError> {
//! let buffers = BufferManager::default();
//! let encoder = EnvelopeEncoder::new(MessageVersion::SOAP12_WSA10);
//!
//! let mut message = Message::buffered(encoder.message_version(), MessageHeaders::new().with_action("urn:echo"), "hi");
//! let buffer = encoder.write_message(&mut message, 1024, &buffers).await?;
//! let decoded = encoder.read_message(buffer, &buffers, Some(encoder.content_type()))?;
//! assert_eq!(decoded.headers().action.as_deref(), Some("urn:echo"));
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod encoder;
pub mod error;
pub mod message;
