//! gzip / deflate payload compression for the encoders.

use crate::encoder::content_type::CompressionFormat;
use crate::error::EncodingError;
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io;
use std::io::{Read, Write};
use tracing::trace;

// inspired by from actix-http
pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A one shot compressor, created per message.
pub(crate) enum Compressor {
    Gzip(GzEncoder<Writer>),
    Deflate(ZlibEncoder<Writer>),
}

impl Compressor {
    pub(crate) fn new(format: CompressionFormat) -> Self {
        match format {
            CompressionFormat::GZip => Self::Gzip(GzEncoder::new(Writer::new(), Compression::default())),
            CompressionFormat::Deflate => Self::Deflate(ZlibEncoder::new(Writer::new(), Compression::default())),
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), io::Error> {
        let result = match self {
            Self::Gzip(encoder) => encoder.write_all(data),
            Self::Deflate(encoder) => encoder.write_all(data),
        };
        if let Err(err) = &result {
            trace!("error compressing payload: {}", err);
        }
        result
    }

    pub(crate) fn finish(self) -> Result<Bytes, io::Error> {
        match self {
            Self::Gzip(encoder) => encoder.finish().map(|writer| writer.buf.freeze()),
            Self::Deflate(encoder) => encoder.finish().map(|writer| writer.buf.freeze()),
        }
    }
}

pub(crate) fn compress(format: CompressionFormat, data: &[u8]) -> Result<Bytes, EncodingError> {
    let mut compressor = Compressor::new(format);
    compressor.write(data)?;
    Ok(compressor.finish()?)
}

/// Inflates `data`, refusing to produce more than `limit` bytes.
pub(crate) fn decompress(format: CompressionFormat, data: &[u8], limit: usize) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    // one byte over the limit is enough to tell an overflow apart from an exact fit
    let take = limit as u64 + 1;
    let read = match format {
        CompressionFormat::GZip => GzDecoder::new(data).take(take).read_to_end(&mut out),
        CompressionFormat::Deflate => ZlibDecoder::new(data).take(take).read_to_end(&mut out),
    };

    match read {
        Ok(n) if n > limit => Err(EncodingError::quota_exceeded(limit as u64)),
        Ok(_) => Ok(out),
        Err(e) => Err(EncodingError::malformed(format!("invalid {format} payload: {e}"))),
    }
}
