//! Cross-component error type.
//!
//! Errors cross the pool-cache serializer, the executor API and the router
//! carrying only a stable [`ErrorCode`] and a message. The code decides the
//! HTTP status at the edge, and `from_http` turns a status back into a
//! code on the client side.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for operations that surface a [`FissionError`].
pub type FissionResult<T> = Result<T, FissionError>;

/// Stable error kinds shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Internal,
    NotAuthorized,
    NotFound,
    NameExists,
    InvalidArgument,
    NoSpace,
    NotImplemented,
    ChecksumFail,
    SizeLimitExceeded,
    RequestTimeout,
    TooManyRequests,
    /// Specialization, round-trip or storage exceeded its budget.
    Timeout,
    /// The caller went away before an answer was ready.
    ClientClosed,
}

impl ErrorCode {
    /// Status code answered at an HTTP boundary.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidArgument => 400,
            Self::NotAuthorized => 403,
            Self::NotFound => 404,
            Self::RequestTimeout => 408,
            Self::NameExists => 409,
            Self::TooManyRequests => 429,
            Self::ClientClosed => 499,
            Self::NotImplemented => 501,
            Self::Timeout => 504,
            _ => 500,
        }
    }

    /// Inverse of [`http_status`](Self::http_status) for codes that have a
    /// distinct status; anything else is `Internal`.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            403 => Self::NotAuthorized,
            404 => Self::NotFound,
            408 => Self::RequestTimeout,
            409 => Self::NameExists,
            429 => Self::TooManyRequests,
            499 => Self::ClientClosed,
            501 => Self::NotImplemented,
            504 => Self::Timeout,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Internal => "Internal error",
            Self::NotAuthorized => "Not authorized",
            Self::NotFound => "Resource not found",
            Self::NameExists => "Resource exists",
            Self::InvalidArgument => "Invalid argument",
            Self::NoSpace => "Out of space",
            Self::NotImplemented => "Not implemented",
            Self::ChecksumFail => "Checksum verification failed",
            Self::SizeLimitExceeded => "Size limit exceeded",
            Self::RequestTimeout => "Request timeout",
            Self::TooManyRequests => "Too many requests",
            Self::Timeout => "Timeout",
            Self::ClientClosed => "Client closed request",
        };
        f.write_str(s)
    }
}

/// An error carrying a stable code and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} - {message}")]
pub struct FissionError {
    pub code: ErrorCode,
    pub message: String,
}

impl FissionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TooManyRequests, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Rebuild an error from an HTTP answer: the status picks the code and
    /// the body becomes the message.
    pub fn from_http(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP status {status}")
        } else {
            body.trim().to_string()
        };
        Self::new(ErrorCode::from_http_status(status), message)
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// Prefix the message with context, keeping the code.
    pub fn context(mut self, ctx: impl fmt::Display) -> Self {
        self.message = format!("{ctx}: {}", self.message);
        self
    }
}
