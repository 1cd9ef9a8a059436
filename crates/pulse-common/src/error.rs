//! Error types and result handling for the Pulse platform

use thiserror::Error;

/// Result type alias for Pulse operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Pulse platform operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("service error (status {status}): {message}")]
    Service { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Service { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True for 4xx-style failures that must not be retried
    pub fn is_permanent_external(&self) -> bool {
        matches!(self, Error::Service { status, .. } if (400..500).contains(status))
    }

    /// Get error category for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::Service { .. } => "service",
            Error::Decode(_) => "decode",
            Error::Validation(_) => "validation",
            Error::Store(_) => "store",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Network("refused".into()).is_retryable());
        assert!(Error::Timeout("deadline".into()).is_retryable());
        assert!(Error::Service { status: 503, message: "unavailable".into() }.is_retryable());
        assert!(!Error::Service { status: 422, message: "bad model".into() }.is_retryable());
        assert!(!Error::Validation("empty text".into()).is_retryable());
    }

    #[test]
    fn permanent_external_is_4xx_only() {
        assert!(Error::Service { status: 404, message: "gone".into() }.is_permanent_external());
        assert!(!Error::Service { status: 500, message: "boom".into() }.is_permanent_external());
        assert!(!Error::Network("refused".into()).is_permanent_external());
    }
}
