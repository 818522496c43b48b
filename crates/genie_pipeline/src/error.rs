//! Pipeline error taxonomy.

use crate::checkpoint::CheckpointError;
use crate::launch::LaunchStep;
use crate::services::GenerationError;
use thiserror::Error;

/// Errors surfaced by pipeline operations and stage action handlers.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Generated output failed a shape check. Callers recover with a fallback.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An action was requested before its stage was ready. No state was changed.
    #[error("not ready: {0}")]
    Prerequisite(String),

    /// An external generation or platform call failed.
    #[error("service call failed: {0}")]
    Service(String),

    /// A checkpoint was answered with "stop".
    #[error("Pipeline canceled at {step}")]
    Canceled { step: LaunchStep },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A referenced record does not exist on the project.
    #[error("not found: {0}")]
    NotFound(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn prerequisite(message: impl Into<String>) -> Self {
        Self::Prerequisite(message.into())
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service(message.into())
    }

    /// Short machine-readable kind, used in run records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Prerequisite(_) => "prerequisite",
            Self::Service(_) => "service",
            Self::Canceled { .. } => "canceled",
            Self::Checkpoint(_) => "checkpoint",
            Self::Persistence(_) => "persistence",
            Self::NotFound(_) => "not_found",
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

impl From<GenerationError> for PipelineError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Malformed(msg) => Self::Validation(msg),
            GenerationError::Unavailable(msg) => Self::Service(msg),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
