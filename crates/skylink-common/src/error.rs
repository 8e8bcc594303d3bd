//! Transport-level errors shared by every crate that talks to the network.

use crate::BoxError;

/// Transport-level errors that occur during HTTP communication
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TransportError {
    /// Failed to establish connection to server
    #[error("connection error: {0}")]
    #[diagnostic(
        code(skylink_common::transport::connect),
        help("check network connectivity and TLS configuration")
    )]
    Connect(String),

    /// Request timed out
    #[error("request timeout")]
    #[diagnostic(code(skylink_common::transport::timeout))]
    Timeout,

    /// Request construction failed (malformed URI, headers, etc.)
    #[error("invalid request: {0}")]
    #[diagnostic(code(skylink_common::transport::invalid_request))]
    InvalidRequest(String),

    /// Other transport error
    #[error("transport error: {0}")]
    #[diagnostic(code(skylink_common::transport::other))]
    Other(BoxError),
}

impl TransportError {
    /// Wrap an arbitrary client error.
    pub fn other(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(e))
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() || e.is_request() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Other(Box::new(e))
        }
    }
}
