//! Error taxonomy for the mediation pipeline.
//!
//! Every failure a turn can hit maps to exactly one variant; callers decide
//! per variant whether to repair, retry, or fail the whole envelope. Nothing
//! is swallowed on the way up.

use crate::breaker::Component;

/// Errors produced by the mediation layer.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The model reply could not be decoded into the three-field envelope,
    /// even after textual repair.
    #[error("structural validation failed: {detail}")]
    Structural { detail: String },

    /// Generated code failed to parse, even after every repair patch.
    #[error("code syntax validation failed: {detail}")]
    Syntax { detail: String },

    /// Generated code references a denied capability. Never repaired.
    #[error("security validation failed: {detail}")]
    Security { detail: String },

    /// The sandboxed execution failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A runtime value could not be converted to a transmission-safe shape.
    #[error("serialization failed: {detail}")]
    Serialization { detail: String },

    /// A circuit-broken component is open; the call was not attempted.
    #[error("{component} is unavailable (circuit open)")]
    UpstreamUnavailable { component: Component },

    /// The model stream did not complete within the collection timeout.
    #[error("response collection timed out after {elapsed_ms}ms")]
    CollectionTimeout { elapsed_ms: u64 },

    /// The turn was cancelled before completion.
    #[error("turn cancelled")]
    Cancelled,

    /// Transport failure talking to the model API.
    #[error("model transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures inside the sandboxed executor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("script raised: {message}")]
    Raised {
        message: String,
        line: Option<usize>,
    },

    #[error("script exceeded its resource budget ({limit})")]
    ResourceLimit { limit: u64 },
}

impl ExecutionError {
    /// Stable kind tag carried in [`ExecutionResult`] error records.
    ///
    /// [`ExecutionResult`]: crate::domain::ExecutionResult
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "timeout",
            ExecutionError::Raised { .. } => "raised",
            ExecutionError::ResourceLimit { .. } => "resource_limit",
        }
    }
}

impl From<sluice_script::ScriptError> for ExecutionError {
    fn from(err: sluice_script::ScriptError) -> Self {
        use sluice_script::ScriptError;
        match err {
            ScriptError::ResourceLimit { limit } => ExecutionError::ResourceLimit { limit },
            other => ExecutionError::Raised {
                line: other.line(),
                message: other.to_string(),
            },
        }
    }
}

/// Result type for mediation operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
