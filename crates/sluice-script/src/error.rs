//! Error taxonomy for parsing and executing sluice-script.

/// Errors produced while parsing or running a script.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("runtime error at line {line}: {message}")]
    Raised { line: usize, message: String },

    #[error("import of `{module}` is not allowed (line {line})")]
    ImportDenied { line: usize, module: String },

    #[error("execution exceeded the step budget of {limit}")]
    ResourceLimit { limit: u64 },

    #[error("execution cancelled")]
    Cancelled,
}

impl ScriptError {
    /// Source line the error is attributed to, when known.
    pub fn line(&self) -> Option<usize> {
        match self {
            ScriptError::Parse { line, .. }
            | ScriptError::Raised { line, .. }
            | ScriptError::ImportDenied { line, .. } => Some(*line),
            ScriptError::ResourceLimit { .. } | ScriptError::Cancelled => None,
        }
    }
}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;
