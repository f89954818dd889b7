use http::StatusCode;
use micro_soap::error::EncodingError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Every failure the transports surface.
///
/// Environment specific I/O failures are funnelled through [`TransportError::from_io`], so callers
/// only ever inspect this closed set of variants.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("protocol error: {message}")]
    Protocol { message: String, status: StatusCode, reason: Option<String> },

    #[error("the transport action `{transport}` does not match the message action `{message}`")]
    ActionMismatch { transport: String, message: String },

    #[error("addressing header `{header}` is not allowed on the wire when addressing is disabled")]
    AddressingHeaderOnWire { header: &'static str },

    #[error("message size exceeds the configured quota of {limit} bytes")]
    QuotaExceeded { limit: u64 },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: &'static str, timeout: Duration },

    #[error("communication object aborted: {reason}")]
    Aborted { reason: String },

    #[error("communication error: {message}")]
    Communication { message: String },

    #[error("authentication failed with status {status}")]
    AuthenticationFailed { status: StatusCode },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("unsupported feature: {feature}")]
    Unsupported { feature: &'static str },

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("io error: {source}")]
    Io {
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn protocol<S: ToString>(status: StatusCode, message: S) -> Self {
        Self::Protocol { message: message.to_string(), status, reason: None }
    }

    /// A protocol error carrying the reason phrase to put on the status line.
    pub fn protocol_with_reason<S: ToString>(status: StatusCode, reason: S) -> Self {
        let reason = reason.to_string();
        Self::Protocol { message: reason.clone(), status, reason: Some(reason) }
    }

    pub fn quota_exceeded(limit: u64) -> Self {
        Self::QuotaExceeded { limit }
    }

    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    pub fn aborted<S: ToString>(reason: S) -> Self {
        Self::Aborted { reason: reason.to_string() }
    }

    pub fn communication<S: ToString>(message: S) -> Self {
        Self::Communication { message: message.to_string() }
    }

    pub fn invalid_operation<S: ToString>(reason: S) -> Self {
        Self::InvalidOperation { reason: reason.to_string() }
    }

    pub fn configuration<S: ToString>(reason: S) -> Self {
        Self::Configuration { reason: reason.to_string() }
    }

    pub fn unsupported(feature: &'static str) -> Self {
        Self::Unsupported { feature }
    }

    /// Canonicalizes an I/O failure.
    ///
    /// A `TransportError` carried inside the `io::Error` (the stream adapters report quota and
    /// timeout failures that way) is unwrapped. Known kinds map onto transport variants and
    /// anything else is kept unchanged as [`TransportError::Io`].
    pub fn from_io(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<TransportError>()) {
            if let Some(Ok(inner)) = e.into_inner().map(|inner| inner.downcast::<TransportError>()) {
                return *inner;
            }
            return Self::communication("lost the transport cause of an io error");
        }

        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::aborted(e),
            io::ErrorKind::TimedOut => Self::Timeout { operation: "io", timeout: Duration::ZERO },
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => Self::protocol(StatusCode::BAD_REQUEST, e),
            _ => Self::Io { source: e },
        }
    }

    /// The status used when this error has to become an HTTP response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Protocol { status, .. } | Self::AuthenticationFailed { status } => *status,
            Self::ActionMismatch { .. } | Self::AddressingHeaderOnWire { .. } => StatusCode::BAD_REQUEST,
            Self::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::Aborted { .. }
            | Self::Communication { .. }
            | Self::InvalidOperation { .. }
            | Self::Configuration { .. }
            | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The reason phrase to announce on the status line, if one was recorded.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Protocol { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    /// Unrecoverable failures never reach this type: panics and allocation failures unwind past
    /// the transport instead of becoming values.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::from_io(e)
    }
}

impl From<EncodingError> for TransportError {
    fn from(e: EncodingError) -> Self {
        match e {
            EncodingError::Malformed { reason } => Self::protocol(StatusCode::BAD_REQUEST, reason),
            EncodingError::QuotaExceeded { limit } => Self::quota_exceeded(limit),
            EncodingError::BodyConsumed => Self::invalid_operation("message body has already been consumed"),
            EncodingError::InvalidState { reason } => Self::invalid_operation(reason),
            EncodingError::Io { source } => Self::from_io(source),
        }
    }
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io { source } => source,
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smuggled_error_is_unwrapped() {
        let io_error: io::Error = TransportError::quota_exceeded(10).into();
        assert!(matches!(TransportError::from_io(io_error), TransportError::QuotaExceeded { limit: 10 }));
    }

    #[test]
    fn io_kinds_are_canonicalized() {
        let aborted = TransportError::from_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(aborted, TransportError::Aborted { .. }));

        let protocol = TransportError::from_io(io::Error::new(io::ErrorKind::InvalidData, "bad frame"));
        assert_eq!(protocol.status_code(), StatusCode::BAD_REQUEST);

        let unknown = TransportError::from_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(unknown, TransportError::Io { .. }));
        assert!(!unknown.is_fatal());
    }

    #[test]
    fn status_codes() {
        assert_eq!(TransportError::quota_exceeded(1).status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(TransportError::unsupported("keep-alive").status_code(), StatusCode::NOT_IMPLEMENTED);

        let error = TransportError::protocol_with_reason(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Missing Content Type");
        assert_eq!(error.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(error.reason(), Some("Missing Content Type"));
    }

    #[test]
    fn encoding_errors_map_onto_transport_errors() {
        let error: TransportError = EncodingError::malformed("broken").into();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);

        let error: TransportError = EncodingError::quota_exceeded(42).into();
        assert!(matches!(error, TransportError::QuotaExceeded { limit: 42 }));
    }
}
