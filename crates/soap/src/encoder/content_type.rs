//! Content types of the binary encodings and their compressed variants.
//!
//! A compressed payload is announced on the wire with the plain content type plus a
//! `Content-Encoding` header, while encoders reason about a single content type string
//! carrying a `+gzip` / `+deflate` suffix. The helpers here convert between both forms.

use std::fmt;
use std::str::FromStr;

/// Payload compression negotiated through `Content-Encoding` / `Accept-Encoding`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompressionFormat {
    GZip,
    Deflate,
}

impl CompressionFormat {
    /// The `Content-Encoding` token of this format.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionFormat::GZip => "gzip",
            CompressionFormat::Deflate => "deflate",
        }
    }

    /// Picks the first format listed in an `Accept-Encoding` value, preferring gzip.
    pub fn select(accept_encodings: &str) -> Option<Self> {
        let offered = |name: &str| {
            accept_encodings.split(',').any(|token| {
                let mut parts = token.split(';');
                let coding = parts.next().unwrap_or_default().trim();
                // `gzip;q=0` explicitly refuses the coding
                let refused = parts.any(|param| param.trim().eq_ignore_ascii_case("q=0"));
                coding.eq_ignore_ascii_case(name) && !refused
            })
        };

        if offered("gzip") {
            Some(Self::GZip)
        } else if offered("deflate") {
            Some(Self::Deflate)
        } else {
            None
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("gzip") => Ok(Self::GZip),
            s if s.eq_ignore_ascii_case("deflate") => Ok(Self::Deflate),
            _ => Err(()),
        }
    }
}

/// The content types of the binary message encodings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BinaryVersion {
    content_type: &'static str,
    session_content_type: &'static str,
}

impl BinaryVersion {
    pub const VERSION1: BinaryVersion =
        BinaryVersion { content_type: "application/soap+msbin1", session_content_type: "application/soap+msbin1session" };
    pub const GZIP_VERSION1: BinaryVersion = BinaryVersion {
        content_type: "application/soap+msbin1+gzip",
        session_content_type: "application/soap+msbin1session+gzip",
    };
    pub const DEFLATE_VERSION1: BinaryVersion = BinaryVersion {
        content_type: "application/soap+msbin1+deflate",
        session_content_type: "application/soap+msbin1session+deflate",
    };

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn session_content_type(&self) -> &'static str {
        self.session_content_type
    }
}

/// Appends the compression suffix matching `content_encoding` to a plain binary content type.
///
/// Content types that have no compressed variant are returned unchanged.
pub fn content_type_for_compression(content_type: &str, content_encoding: CompressionFormat) -> String {
    let compressed = match content_encoding {
        CompressionFormat::GZip => BinaryVersion::GZIP_VERSION1,
        CompressionFormat::Deflate => BinaryVersion::DEFLATE_VERSION1,
    };

    if content_type == BinaryVersion::VERSION1.content_type {
        compressed.content_type.to_string()
    } else if content_type == BinaryVersion::VERSION1.session_content_type {
        compressed.session_content_type.to_string()
    } else {
        content_type.to_string()
    }
}

/// Splits a compressed binary content type into the plain content type to announce and the
/// `Content-Encoding` token to send alongside it.
pub fn get_http_response_type_and_encoding_for_compression(content_type: &str) -> (String, Option<CompressionFormat>) {
    let table = [
        (BinaryVersion::GZIP_VERSION1.content_type, BinaryVersion::VERSION1.content_type, CompressionFormat::GZip),
        (
            BinaryVersion::GZIP_VERSION1.session_content_type,
            BinaryVersion::VERSION1.session_content_type,
            CompressionFormat::GZip,
        ),
        (BinaryVersion::DEFLATE_VERSION1.content_type, BinaryVersion::VERSION1.content_type, CompressionFormat::Deflate),
        (
            BinaryVersion::DEFLATE_VERSION1.session_content_type,
            BinaryVersion::VERSION1.session_content_type,
            CompressionFormat::Deflate,
        ),
    ];

    table
        .iter()
        .find(|(compressed, _, _)| *compressed == content_type)
        .map(|(_, plain, format)| ((*plain).to_string(), Some(*format)))
        .unwrap_or_else(|| (content_type.to_string(), None))
}

/// The compression announced by a content type suffix, if any.
pub fn compression_of(content_type: &str) -> Option<CompressionFormat> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if media_type.ends_with("+gzip") {
        Some(CompressionFormat::GZip)
    } else if media_type.ends_with("+deflate") {
        Some(CompressionFormat::Deflate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_response_type_maps_back_to_plain() {
        let (content_type, encoding) =
            get_http_response_type_and_encoding_for_compression(BinaryVersion::GZIP_VERSION1.content_type());
        assert_eq!(content_type, BinaryVersion::VERSION1.content_type());
        assert_eq!(encoding.map(|e| e.name()), Some("gzip"));
    }

    #[test]
    fn session_and_deflate_variants() {
        let (content_type, encoding) =
            get_http_response_type_and_encoding_for_compression(BinaryVersion::DEFLATE_VERSION1.session_content_type());
        assert_eq!(content_type, BinaryVersion::VERSION1.session_content_type());
        assert_eq!(encoding, Some(CompressionFormat::Deflate));

        let (content_type, encoding) = get_http_response_type_and_encoding_for_compression("text/xml");
        assert_eq!(content_type, "text/xml");
        assert_eq!(encoding, None);
    }

    #[test]
    fn plain_type_gains_suffix() {
        assert_eq!(
            content_type_for_compression(BinaryVersion::VERSION1.content_type(), CompressionFormat::GZip),
            BinaryVersion::GZIP_VERSION1.content_type()
        );
        assert_eq!(content_type_for_compression("text/xml", CompressionFormat::GZip), "text/xml");
        assert_eq!(compression_of("application/soap+msbin1+deflate"), Some(CompressionFormat::Deflate));
    }

    #[test]
    fn select_from_accept_encoding() {
        assert_eq!(CompressionFormat::select("br, deflate, gzip"), Some(CompressionFormat::GZip));
        assert_eq!(CompressionFormat::select("deflate"), Some(CompressionFormat::Deflate));
        assert_eq!(CompressionFormat::select("gzip;q=0, identity"), None);
        assert_eq!(CompressionFormat::select("zstd"), None);
    }
}
