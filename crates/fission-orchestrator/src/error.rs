//! Orchestrator error types.

use fission_core::{ErrorCode, FissionError};
use thiserror::Error;

/// Errors returned by [`Orchestrator`](crate::Orchestrator) implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("conflict updating {kind} {key}: {reason}")]
    Conflict {
        kind: &'static str,
        key: String,
        reason: String,
    },

    #[error("orchestrator API error: {0}")]
    Api(String),
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<OrchestratorError> for FissionError {
    fn from(err: OrchestratorError) -> Self {
        let code = match &err {
            OrchestratorError::NotFound { .. } => ErrorCode::NotFound,
            OrchestratorError::AlreadyExists { .. } => ErrorCode::NameExists,
            _ => ErrorCode::Internal,
        };
        FissionError::new(code, err.to_string())
    }
}
