//! Error types for the catalog store.

use fission_core::{ErrorCode, FissionError};
use thiserror::Error;

/// Result type alias for catalog operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("resource version conflict on {key}: have {current}, got {given}")]
    Conflict {
        key: String,
        current: String,
        given: String,
    },
}

impl From<StateError> for FissionError {
    fn from(err: StateError) -> Self {
        let code = match &err {
            StateError::NotFound(_) => ErrorCode::NotFound,
            StateError::AlreadyExists(_) => ErrorCode::NameExists,
            StateError::Conflict { .. } => ErrorCode::NameExists,
            _ => ErrorCode::Internal,
        };
        FissionError::new(code, err.to_string())
    }
}
