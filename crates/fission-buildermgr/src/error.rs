//! Error types for the builder manager.

use fission_client::ClientError;
use fission_core::{ErrorCode, FissionError};
use fission_orchestrator::OrchestratorError;
use fission_state::StateError;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("environment does not exist: \"{namespace}/{name}\"")]
    EnvironmentNotFound { namespace: String, name: String },

    #[error("Build timeout due to environment builder not ready")]
    BuilderNotReady,

    #[error("error fetching source package: {0}")]
    Fetch(#[source] ClientError),

    /// The builder rejected the build; its logs are kept separately.
    #[error("Error building deployment package: {0}")]
    Build(String),

    #[error("Error uploading deployment package: {0}")]
    Upload(#[source] ClientError),

    #[error("found more than one builder {kind} for environment \"{env}\"")]
    DuplicateBuilder { kind: &'static str, env: String },

    #[error(transparent)]
    Catalog(#[from] StateError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Core(#[from] FissionError),
}

impl From<BuildError> for FissionError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Catalog(e) => e.into(),
            BuildError::Orchestrator(e) => e.into(),
            BuildError::Core(e) => e,
            BuildError::EnvironmentNotFound { .. } => FissionError::not_found(err.to_string()),
            BuildError::BuilderNotReady => FissionError::new(ErrorCode::Timeout, err.to_string()),
            other => FissionError::internal(other.to_string()),
        }
    }
}
