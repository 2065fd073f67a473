//! Client error types.

use std::time::Duration;

use fission_core::{ErrorCode, FissionError};
use thiserror::Error;

/// Errors from talking to another Fission component over HTTP.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error talking to {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: hyper::Error,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("{url} answered {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
}

impl ClientError {
    /// The peer could not be reached at all (as opposed to answering badly).
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// HTTP status of a non-success answer.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

impl From<ClientError> for FissionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Status { status, body, .. } => FissionError::from_http(status, &body),
            ClientError::Timeout { .. } => FissionError::new(ErrorCode::Timeout, err.to_string()),
            other => FissionError::internal(other.to_string()),
        }
    }
}
