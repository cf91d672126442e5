//! Sandboxed execution of validated code.
//!
//! The [`Executor`] seam lets the pipeline run against the in-process
//! script interpreter in production and against doubles in tests. The
//! reference implementation runs the interpreter on a blocking task under a
//! hard wall-clock timeout; on timeout the interpreter's cancel flag is
//! raised so the worker thread actually stops, and the failure is reported
//! as a timeout rather than left running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sluice_script::{parser, Interpreter, InterpreterConfig, Namespace, RuntimeValue, Table};

use crate::domain::ExecutionResult;
use crate::error::ExecutionError;

/// Execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Hard wall-clock limit for one execution (milliseconds).
    pub timeout_ms: u64,
    /// Interpreter step budget.
    pub max_steps: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_steps: 100_000,
        }
    }
}

/// Runs validated code against a namespace seeded with the turn's data.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, code: &str, bound_data: Option<Table>) -> ExecutionResult;
}

/// In-process interpreter-backed executor.
pub struct ScriptExecutor {
    config: SandboxConfig,
}

impl ScriptExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

/// Raises the interpreter cancel flag when dropped, so abandoning the
/// execute future (timeout, turn cancellation) stops the worker thread.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    async fn execute(&self, code: &str, bound_data: Option<Table>) -> ExecutionResult {
        let program = match parser::parse(code) {
            Ok(program) => program,
            Err(err) => {
                return ExecutionResult::failure(&ExecutionError::from(err), String::new())
            }
        };

        let interpreter = Interpreter::new(InterpreterConfig {
            max_steps: self.config.max_steps,
        });
        let _cancel_guard = CancelOnDrop(interpreter.cancel_flag());

        let mut namespace = Namespace::new();
        if let Some(table) = bound_data {
            namespace.set("data", RuntimeValue::Table(table));
        }

        let worker = tokio::task::spawn_blocking(move || {
            let outcome = interpreter.run(&program, &mut namespace);
            (namespace, outcome)
        });

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok((namespace, Ok(output)))) => ExecutionResult::success(output, namespace),
            Ok(Ok((_, Err(script_err)))) => {
                ExecutionResult::failure(&ExecutionError::from(script_err), String::new())
            }
            Ok(Err(join_err)) => ExecutionResult::failure(
                &ExecutionError::Raised {
                    message: format!("executor worker failed: {join_err}"),
                    line: None,
                },
                String::new(),
            ),
            Err(_elapsed) => ExecutionResult::failure(
                &ExecutionError::Timeout {
                    limit_ms: self.config.timeout_ms,
                },
                String::new(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ScriptExecutor {
        ScriptExecutor::new(SandboxConfig::default())
    }

    fn sample_table() -> Table {
        Table {
            columns: vec!["score".into()],
            rows: vec![
                vec![RuntimeValue::Int(10)],
                vec![RuntimeValue::Int(20)],
                vec![RuntimeValue::Int(30)],
            ],
        }
    }

    #[tokio::test]
    async fn test_executes_and_captures_output() {
        let result = executor()
            .execute("x = 2 + 3\nprint(\"x is\", x)", None)
            .await;
        assert!(result.succeeded());
        assert_eq!(result.captured_output, "x is 5\n");
        assert_eq!(result.namespace.get("x"), Some(&RuntimeValue::Int(5)));
    }

    #[tokio::test]
    async fn test_data_handle_is_bound() {
        let result = executor()
            .execute("result = sum(data[\"score\"])", Some(sample_table()))
            .await;
        assert!(result.succeeded());
        assert_eq!(result.namespace.get("result"), Some(&RuntimeValue::Int(60)));
    }

    #[tokio::test]
    async fn test_runtime_error_reports_line() {
        let result = executor().execute("x = 1\ny = nope", None).await;
        assert!(!result.succeeded());
        let error = result.error.unwrap();
        assert_eq!(error.kind, "raised");
        assert_eq!(error.line, Some(2));
    }

    #[tokio::test]
    async fn test_step_budget_reported_as_resource_limit() {
        let executor = ScriptExecutor::new(SandboxConfig {
            timeout_ms: 5_000,
            max_steps: 5,
        });
        let result = executor.execute("x = [1, 2, 3, 4, 5, 6, 7, 8]", None).await;
        assert!(!result.succeeded());
        assert_eq!(result.error.unwrap().kind, "resource_limit");
    }

    #[tokio::test]
    async fn test_denied_import_fails_at_runtime() {
        let result = executor().execute("import os", None).await;
        assert!(!result.succeeded());
        let error = result.error.unwrap();
        assert_eq!(error.kind, "raised");
        assert!(error.message.contains("os"));
    }

    #[tokio::test]
    async fn test_result_namespace_is_fresh_per_run() {
        let exec = executor();
        let first = exec.execute("a = 1", None).await;
        let second = exec.execute("b = 2", None).await;
        assert!(first.namespace.get("b").is_none());
        assert!(second.namespace.get("a").is_none());
    }
}
