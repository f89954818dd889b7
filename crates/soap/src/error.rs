use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("message size exceeds the configured quota of {limit} bytes")]
    QuotaExceeded { limit: u64 },

    #[error("message body has already been consumed")]
    BodyConsumed,

    #[error("invalid message state: {reason}")]
    InvalidState { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl EncodingError {
    pub fn malformed<S: ToString>(str: S) -> Self {
        Self::Malformed { reason: str.to_string() }
    }

    pub fn quota_exceeded(limit: u64) -> Self {
        Self::QuotaExceeded { limit }
    }

    pub fn invalid_state<S: ToString>(str: S) -> Self {
        Self::InvalidState { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
