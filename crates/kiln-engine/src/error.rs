use kiln_contracts::content::ContentType;
use kiln_contracts::error::{StoreError, TransitionError};
use kiln_contracts::jobs::JobId;
use kiln_contracts::providers::{Engine, SelectionError};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderError;

/// One failed provider attempt inside a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub engine: Engine,
    pub kind: String,
    pub message: String,
}

impl AttemptFailure {
    pub fn new(engine: Engine, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            engine,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&ProviderError> for AttemptFailure {
    fn from(err: &ProviderError) -> Self {
        Self::new(err.engine(), err.kind(), err.to_string())
    }
}

/// Everything the orchestrator surfaces to its caller. Transient polling
/// failures never appear here; the tracker absorbs them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("engine '{engine}' does not support content type '{content_type}'")]
    IncompatibleProvider {
        engine: Engine,
        content_type: ContentType,
    },
    #[error("no engine can produce content type '{content_type}'")]
    NoEngine { content_type: ContentType },
    #[error("engine '{engine}' could not start generation: {message}")]
    ProviderUnavailable { engine: Engine, message: String },
    #[error(
        "all engines failed for '{content_type}'; last error from '{}': {}",
        last.engine,
        last.message
    )]
    AllProvidersExhausted {
        content_type: ContentType,
        attempts: Vec<AttemptFailure>,
        last: AttemptFailure,
    },
    #[error("engine '{engine}' is over its request budget; retry in {retry_after_seconds}s")]
    RateLimited {
        engine: Engine,
        retry_after_seconds: u64,
    },
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job {0} is still running")]
    JobStillActive(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::IncompatibleProvider { .. } => "incompatible_provider",
            OrchestratorError::NoEngine { .. } => "no_engine",
            OrchestratorError::ProviderUnavailable { .. } => "provider_unavailable",
            OrchestratorError::AllProvidersExhausted { .. } => "all_providers_exhausted",
            OrchestratorError::RateLimited { .. } => "rate_limited",
            OrchestratorError::JobNotFound(_) => "job_not_found",
            OrchestratorError::JobStillActive(_) => "job_active",
            OrchestratorError::Transition(_) => "invalid_transition",
            OrchestratorError::Store(_) => "store",
        }
    }

    /// Whether dispatching again may succeed without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ProviderUnavailable { .. }
                | OrchestratorError::RateLimited { .. }
                | OrchestratorError::Store(StoreError::Conflict { .. })
        )
    }

    pub fn engine(&self) -> Option<Engine> {
        match self {
            OrchestratorError::IncompatibleProvider { engine, .. }
            | OrchestratorError::ProviderUnavailable { engine, .. }
            | OrchestratorError::RateLimited { engine, .. } => Some(*engine),
            OrchestratorError::AllProvidersExhausted { last, .. } => Some(last.engine),
            _ => None,
        }
    }
}

impl From<SelectionError> for OrchestratorError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::Incompatible {
                engine,
                content_type,
            } => OrchestratorError::IncompatibleProvider {
                engine,
                content_type,
            },
            SelectionError::NoEngine { content_type } => {
                OrchestratorError::NoEngine { content_type }
            }
        }
    }
}
