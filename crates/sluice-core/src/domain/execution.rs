//! The outcome of one sandboxed execution.

use serde::{Deserialize, Serialize};
use sluice_script::Namespace;

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Structured error record carried alongside a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl From<&ExecutionError> for ExecutionErrorRecord {
    fn from(err: &ExecutionError) -> Self {
        let line = match err {
            ExecutionError::Raised { line, .. } => *line,
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            line,
        }
    }
}

/// Everything one execution left behind. Owned by its turn; a new turn gets
/// a new result.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub captured_output: String,
    /// Name → value bindings, pre-serialization, in insertion order.
    pub namespace: Namespace,
    pub error: Option<ExecutionErrorRecord>,
}

impl ExecutionResult {
    pub fn success(captured_output: String, namespace: Namespace) -> Self {
        Self {
            status: ExecutionStatus::Success,
            captured_output,
            namespace,
            error: None,
        }
    }

    pub fn failure(error: &ExecutionError, captured_output: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            captured_output,
            namespace: Namespace::new(),
            error: Some(ExecutionErrorRecord::from(error)),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
