//! Per-turn orchestration.
//!
//! A turn is the unit of work: user query in, validated streamed response
//! out. The orchestrator owns the active-turn registry and wires the
//! pipeline together: circuit-broken model collection, validation,
//! streaming, sandboxed execution, result serialization, and a second,
//! shorter model call for commentary over the sanitized results.
//! Cancellation aborts the in-flight pipeline at the next await point; an
//! abandoned turn streams nothing further.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sluice_script::{SerializedValue, Table};
use tokio::sync::{mpsc, Notify};
use tracing::Instrument;
use uuid::Uuid;

use crate::breaker::{BreakerRegistry, Component};
use crate::config::CoreConfig;
use crate::domain::{ExecutionErrorRecord, ExecutionResult, Field};
use crate::error::{CoreError, CoreResult, ExecutionError};
use crate::metrics::METRICS;
use crate::model::{ChatMessage, ChatRequest, ModelClient};
use crate::obs;
use crate::response::ResponseManager;
use crate::sandbox::Executor;
use crate::serialize::{extract_results, ResultSet};
use crate::stream::{FinalEnvelope, StreamEvent, StreamingController};
use crate::validation::{extract_string_field, Validator};

/// Opaque identifier of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Streamed to the receiver when the model API circuit is open: a canned
/// reply instead of a retry storm.
const FALLBACK_ANALYSIS: &str =
    "The analysis service is temporarily unavailable. Your question was not \
     lost; please try again in a moment.";

struct ActiveTurn {
    cancel: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

/// Builds and supervises turns.
pub struct Orchestrator {
    config: CoreConfig,
    client: Arc<dyn ModelClient>,
    executor: Arc<dyn Executor>,
    breakers: Arc<BreakerRegistry>,
    turns: Mutex<HashMap<TurnId, ActiveTurn>>,
}

impl Orchestrator {
    pub fn new(
        config: CoreConfig,
        client: Arc<dyn ModelClient>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let breakers = Arc::new(BreakerRegistry::new(&config.breakers));
        Arc::new(Self {
            config,
            client,
            executor,
            breakers,
            turns: Mutex::new(HashMap::new()),
        })
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Probe the model server's health endpoint, through the external-io
    /// breaker so a dead endpoint stops being hammered.
    pub async fn model_available(&self) -> bool {
        self.breakers
            .call(Component::ExternalIo, || async {
                if self.client.health_check().await {
                    Ok(())
                } else {
                    Err(CoreError::Transport("model health probe failed".into()))
                }
            })
            .await
            .is_ok()
    }

    pub fn active_turns(&self) -> usize {
        self.lock_turns().len()
    }

    /// Start a turn; events arrive on the returned receiver.
    pub fn begin_turn(
        self: &Arc<Self>,
        query: String,
        data: Option<Table>,
    ) -> (TurnId, mpsc::UnboundedReceiver<StreamEvent>) {
        let turn_id = TurnId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(Notify::new());

        let this = Arc::clone(self);
        let task_cancel = Arc::clone(&cancel);
        let task = tokio::spawn(async move {
            let controller = StreamingController::new(this.config.streaming.clone(), tx);
            tokio::select! {
                _ = task_cancel.notified() => {
                    obs::emit_turn_cancelled(&turn_id.to_string());
                    METRICS.inc_turns_failed();
                }
                _ = this.run_turn(turn_id, &query, data, controller) => {}
            }
            this.lock_turns().remove(&turn_id);
        });

        self.lock_turns().insert(turn_id, ActiveTurn { cancel, task });
        (turn_id, rx)
    }

    /// Cancel an in-flight turn. Returns whether the turn was active.
    pub fn cancel_turn(&self, turn_id: TurnId) -> bool {
        let entry = self.lock_turns().remove(&turn_id);
        match entry {
            Some(active) => {
                active.cancel.notify_one();
                // If the task is parked somewhere without an await soon,
                // aborting is still safe: nothing past a frozen envelope
                // holds external resources.
                active.task.abort();
                true
            }
            None => false,
        }
    }

    fn lock_turns(&self) -> std::sync::MutexGuard<'_, HashMap<TurnId, ActiveTurn>> {
        self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_turn(
        &self,
        turn_id: TurnId,
        query: &str,
        data: Option<Table>,
        mut controller: StreamingController,
    ) {
        let id_str = turn_id.to_string();
        let span = obs::turn_span(&id_str);
        async {
            let started = Instant::now();
            obs::emit_turn_started(&id_str, query.chars().count(), data.is_some());
            controller.start(&id_str);

            let outcome = self
                .pipeline(&id_str, query, data, &mut controller)
                .await;

            let success = outcome.is_ok();
            match outcome {
                Ok(()) => METRICS.inc_turns_completed(),
                Err(CoreError::UpstreamUnavailable {
                    component: Component::ModelApi,
                }) => {
                    // Canned fallback: the receiver still gets a complete,
                    // well-formed turn.
                    METRICS.inc_breaker_rejections();
                    METRICS.inc_turns_failed();
                    controller
                        .replay_field(Field::Analysis, FALLBACK_ANALYSIS)
                        .await;
                    controller.end(FinalEnvelope {
                        analysis: FALLBACK_ANALYSIS.to_string(),
                        ..FinalEnvelope::default()
                    });
                }
                Err(err) => {
                    METRICS.inc_turns_failed();
                    controller.error(error_kind(&err), &err.to_string());
                }
            }
            obs::emit_turn_finished(&id_str, started.elapsed().as_millis() as u64, success);
            METRICS.flush();
        }
        .instrument(span)
        .await;
    }

    async fn pipeline(
        &self,
        turn_id: &str,
        query: &str,
        data: Option<Table>,
        controller: &mut StreamingController,
    ) -> CoreResult<()> {
        // Phase 1: collect and validate the analysis/code envelope,
        // surfacing the analysis field early as it streams in.
        let validator = Validator::new(self.config.repair.patch_order.clone());
        let mut manager = ResponseManager::new(validator, self.config.collection.clone())
            .with_breakers(Arc::clone(&self.breakers));
        let request = analysis_request(query, data.as_ref());

        let mut envelope = self
            .breakers
            .call(Component::ModelApi, || async {
                manager
                    .collect(self.client.as_ref(), &request, turn_id, |raw| {
                        if let Some(partial) = extract_string_field(raw, Field::Analysis.as_str())
                        {
                            controller.send_partial(Field::Analysis, &partial.text);
                        }
                    })
                    .await
            })
            .await?;

        manager.begin_streaming();
        envelope.release()?;

        let analysis = envelope.field(Field::Analysis).to_string();
        let code = envelope.field(Field::Code).to_string();
        controller.replay_field(Field::Analysis, &analysis).await;
        if !code.is_empty() {
            controller.replay_field(Field::Code, &code).await;
        }

        // Phase 2: execute the validated code and serialize what it left
        // behind.
        let (results, captured_output, exec_error) = if code.trim().is_empty() {
            (ResultSet::default(), String::new(), None)
        } else {
            let execution = self.execute_guarded(turn_id, &code, data).await;
            let error = execution.error.clone();
            let results = self
                .breakers
                .call(Component::Serialization, || async {
                    Ok(extract_results(
                        &execution.namespace,
                        &self.config.serialization,
                    ))
                })
                .await
                .unwrap_or_default();
            (results, execution.captured_output, error)
        };
        controller.execution_results(results.clone(), captured_output.clone(), exec_error.clone());

        // Phase 3: a second, shorter model call narrates the sanitized
        // results. Chart payloads are elided from the prompt.
        let commentary = match self
            .commentary_guarded(query, &results, &captured_output, exec_error.as_ref())
            .await
        {
            Ok(text) => {
                controller.send_partial(Field::Commentary, &text);
                controller.replay_field(Field::Commentary, &text).await;
                text
            }
            Err(err) => {
                // Commentary is best-effort: the results are already out.
                controller.error(error_kind(&err), &err.to_string());
                String::new()
            }
        };

        controller.end(FinalEnvelope {
            analysis,
            code,
            commentary,
        });
        manager.complete();
        Ok(())
    }

    async fn execute_guarded(
        &self,
        turn_id: &str,
        code: &str,
        data: Option<Table>,
    ) -> ExecutionResult {
        METRICS.inc_executions_run();
        let started = Instant::now();
        let mut slot: Option<ExecutionResult> = None;
        let outcome = self
            .breakers
            .call(Component::Executor, || async {
                let result = self.executor.execute(code, data).await;
                let failed = result.error.clone();
                slot = Some(result);
                match failed {
                    None => Ok(()),
                    Some(record) => Err(CoreError::Execution(record_to_error(&record))),
                }
            })
            .await;

        let result = match (slot, outcome) {
            (Some(result), _) => result,
            // Circuit open: the executor never ran.
            (None, Err(err)) => ExecutionResult::failure(
                &ExecutionError::Raised {
                    message: err.to_string(),
                    line: None,
                },
                String::new(),
            ),
            (None, Ok(())) => ExecutionResult::success(String::new(), Default::default()),
        };
        obs::emit_execution_finished(
            turn_id,
            started.elapsed().as_millis() as u64,
            result.succeeded(),
            result.namespace.len(),
        );
        result
    }

    async fn commentary_guarded(
        &self,
        query: &str,
        results: &ResultSet,
        captured_output: &str,
        exec_error: Option<&ExecutionErrorRecord>,
    ) -> CoreResult<String> {
        let request = commentary_request(query, results, captured_output, exec_error);
        self.breakers
            .call(Component::ModelApi, || async {
                let stream = self.client.stream_chat(request).await?;
                stream.collect_text().await
            })
            .await
    }
}

fn record_to_error(record: &ExecutionErrorRecord) -> ExecutionError {
    match record.kind.as_str() {
        "timeout" => ExecutionError::Timeout { limit_ms: 0 },
        "resource_limit" => ExecutionError::ResourceLimit { limit: 0 },
        _ => ExecutionError::Raised {
            message: record.message.clone(),
            line: record.line,
        },
    }
}

/// Stable kind tags carried on `stream_error` events.
fn error_kind(err: &CoreError) -> &'static str {
    match err {
        CoreError::Structural { .. } => "structural",
        CoreError::Syntax { .. } => "syntax",
        CoreError::Security { .. } => "security",
        CoreError::Execution(_) => "execution",
        CoreError::Serialization { .. } => "serialization",
        CoreError::UpstreamUnavailable { .. } => "upstream_unavailable",
        CoreError::CollectionTimeout { .. } => "collection_timeout",
        CoreError::Cancelled => "cancelled",
        CoreError::Transport(_) => "transport",
        CoreError::Io(_) => "io",
        CoreError::Json(_) => "json",
    }
}

fn analysis_request(query: &str, data: Option<&Table>) -> ChatRequest {
    let mut system = String::from(
        "You are a data analysis assistant. Reply with a single JSON object \
         with exactly three string fields: \"analysis\" (plain-language \
         reasoning), \"code\" (a script to run, or empty), and \
         \"commentary\" (leave empty).",
    );
    if let Some(table) = data {
        system.push_str(&format!(
            " A table named `data` with {} rows and columns [{}] is bound in \
             the execution namespace.",
            table.len(),
            table.columns.join(", ")
        ));
    }
    ChatRequest::new(vec![
        ChatMessage::system(system),
        ChatMessage::user(query),
    ])
}

fn commentary_request(
    query: &str,
    results: &ResultSet,
    captured_output: &str,
    exec_error: Option<&ExecutionErrorRecord>,
) -> ChatRequest {
    let mut prompt = format!("The user asked: {query}\n\nExecution produced:\n");
    prompt.push_str(&summarize_results(results));
    if !captured_output.is_empty() {
        prompt.push_str(&format!("\nPrinted output:\n{captured_output}"));
    }
    if let Some(error) = exec_error {
        prompt.push_str(&format!("\nThe script failed: {}\n", error.message));
    }
    prompt.push_str("\nWrite a short plain-language commentary on these results.");
    let mut request = ChatRequest::new(vec![
        ChatMessage::system("You narrate analysis results concisely for a non-technical reader."),
        ChatMessage::user(prompt),
    ]);
    request.max_tokens = Some(512);
    request
}

/// Results as prompt text. Chart payloads and full tables stay out of the
/// prompt; the model gets shapes, not blobs.
fn summarize_results(results: &ResultSet) -> String {
    let mut out = String::new();
    for (name, value) in &results.values {
        let rendered = match value {
            SerializedValue::Scalar { value } => value.to_string(),
            SerializedValue::Table {
                columns,
                total_rows,
                ..
            } => format!("table with {total_rows} rows, columns [{}]", columns.join(", ")),
            SerializedValue::Chart { .. } => "[chart omitted]".to_string(),
            SerializedValue::Null => "null".to_string(),
            SerializedValue::Unrepresentable { type_name } => {
                format!("<unrepresentable {type_name}>")
            }
        };
        let marker = if results.primary.as_deref() == Some(name.as_str()) {
            " (primary)"
        } else {
            ""
        };
        out.push_str(&format!("- {name}{marker}: {rendered}\n"));
    }
    if out.is_empty() {
        out.push_str("- no named results\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_elides_chart_payloads() {
        let mut results = ResultSet::default();
        results.values.insert(
            "fig".into(),
            SerializedValue::Chart {
                spec: serde_json::json!({"kind": "bar"}),
                markup: "<figure>big blob</figure>".into(),
            },
        );
        results.values.insert(
            "output".into(),
            SerializedValue::Scalar {
                value: serde_json::json!(42),
            },
        );
        results.primary = Some("output".into());
        let summary = summarize_results(&results);
        assert!(summary.contains("[chart omitted]"));
        assert!(!summary.contains("big blob"));
        assert!(summary.contains("output (primary): 42"));
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(
            error_kind(&CoreError::Security {
                detail: "x".into()
            }),
            "security"
        );
        assert_eq!(error_kind(&CoreError::Cancelled), "cancelled");
    }

    fn orchestrator(replies: Vec<CoreResult<String>>) -> Arc<Orchestrator> {
        let config = CoreConfig::default();
        let client = Arc::new(crate::model::MockModelClient::new(replies));
        let executor = Arc::new(crate::sandbox::ScriptExecutor::new(config.execution.clone()));
        Orchestrator::new(config, client, executor)
    }

    #[tokio::test]
    async fn test_run_turn_future_is_send() {
        // The pipeline runs inside tokio::spawn, so its future must stay
        // Send even with the tracing span attached.
        fn require_send<F: std::future::Future + Send>(future: F) -> F {
            future
        }
        let orch = orchestrator(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = StreamingController::new(orch.config.streaming.clone(), tx);
        require_send(orch.run_turn(TurnId::new(), "q", None, controller)).await;
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn test_model_available_probes_through_the_breaker() {
        let orch = orchestrator(vec![]);
        assert!(orch.model_available().await);
        assert_eq!(
            orch.breakers()
                .health(Component::ExternalIo)
                .consecutive_failures,
            0
        );

        let down = {
            let config = CoreConfig::default();
            let client =
                Arc::new(crate::model::MockModelClient::new(vec![]).with_health(false));
            let executor =
                Arc::new(crate::sandbox::ScriptExecutor::new(config.execution.clone()));
            Orchestrator::new(config, client, executor)
        };
        assert!(!down.model_available().await);
        assert_eq!(
            down.breakers()
                .health(Component::ExternalIo)
                .consecutive_failures,
            1
        );
    }

    #[test]
    fn test_analysis_request_mentions_bound_data() {
        let table = Table {
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec![]],
        };
        let request = analysis_request("what is the trend?", Some(&table));
        assert!(request.messages[0].content.contains("columns [a, b]"));
        assert_eq!(request.messages[1].content, "what is the trend?");
    }
}
