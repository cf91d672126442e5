//! Atomic collection and validation of one model response.
//!
//! The manager owns the response state machine: INITIALIZING → COLLECTING →
//! VALIDATING → VALIDATED → STREAMING → COMPLETED, with FAILED reachable
//! from COLLECTING and VALIDATING. An envelope leaves the manager only
//! fully validated and frozen; fatal validation triggers a bounded number
//! of fresh re-collections, and exhausting them discards everything — no
//! partially valid content ever escapes.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerRegistry, Component};
use crate::domain::{Field, ResponseEnvelope};
use crate::error::{CoreError, CoreResult};
use crate::model::{ChatRequest, ModelClient};
use crate::obs;
use crate::validation::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseState {
    Initializing,
    Collecting,
    Validating,
    Validated,
    Streaming,
    Completed,
    Failed,
}

/// Collection/validation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Wall-clock limit for draining one model stream (milliseconds).
    pub timeout_ms: u64,
    /// Fresh model calls allowed after a fatal validation, before FAILED.
    pub max_recollect_retries: u32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_recollect_retries: 2,
        }
    }
}

/// Drives one response from raw deltas to a frozen, validated envelope.
pub struct ResponseManager {
    validator: Validator,
    config: CollectionConfig,
    state: ResponseState,
    breakers: Option<Arc<BreakerRegistry>>,
}

impl ResponseManager {
    pub fn new(validator: Validator, config: CollectionConfig) -> Self {
        Self {
            validator,
            config,
            state: ResponseState::Initializing,
            breakers: None,
        }
    }

    /// Route the validation pass through the registry's validation breaker.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Collect a full reply from the model and validate it into a frozen
    /// envelope. `on_delta` observes the raw buffer after each delta so the
    /// caller can surface partial content early. An empty code field is
    /// legal — not every reply carries code.
    pub async fn collect(
        &mut self,
        client: &dyn ModelClient,
        request: &ChatRequest,
        turn_id: &str,
        mut on_delta: impl FnMut(&str),
    ) -> CoreResult<ResponseEnvelope> {
        let max_attempts = self.config.max_recollect_retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                obs::emit_recollection(turn_id, attempt, max_attempts);
            }
            self.state = ResponseState::Collecting;
            let raw = match self.drain_stream(client, request, &mut on_delta).await {
                Ok(raw) => raw,
                Err(err @ CoreError::CollectionTimeout { .. }) => {
                    last_error = Some(err);
                    continue;
                }
                Err(err) => {
                    self.state = ResponseState::Failed;
                    return Err(err);
                }
            };

            self.state = ResponseState::Validating;
            let validated = match &self.breakers {
                Some(breakers) => {
                    breakers
                        .call(Component::Validation, || async { self.validate(&raw) })
                        .await
                }
                None => self.validate(&raw),
            };
            match validated {
                Ok(envelope) => {
                    self.state = ResponseState::Validated;
                    return Ok(envelope);
                }
                Err(err) => {
                    // Fatal validation: everything collected this attempt
                    // is rolled back before any retry.
                    last_error = Some(err);
                }
            }
        }

        self.state = ResponseState::Failed;
        Err(last_error.unwrap_or(CoreError::Structural {
            detail: "response collection produced nothing".into(),
        }))
    }

    /// Mark the validated envelope as streaming / completed. The manager
    /// only tracks the state; the streaming controller owns delivery.
    pub fn begin_streaming(&mut self) {
        self.state = ResponseState::Streaming;
    }

    pub fn complete(&mut self) {
        self.state = ResponseState::Completed;
    }

    async fn drain_stream(
        &self,
        client: &dyn ModelClient,
        request: &ChatRequest,
        on_delta: &mut impl FnMut(&str),
    ) -> CoreResult<String> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let collect = async {
            let mut stream = client.stream_chat(request.clone()).await?;
            let mut raw = String::new();
            while let Some(delta) = stream.next().await {
                raw.push_str(&delta?);
                on_delta(&raw);
            }
            Ok(raw)
        };
        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::CollectionTimeout {
                elapsed_ms: self.config.timeout_ms,
            }),
        }
    }

    fn validate(&self, raw: &str) -> CoreResult<ResponseEnvelope> {
        let (structural, fields) = self.validator.envelope(raw);
        let fields = match (structural.is_fatal, fields) {
            (false, Some(fields)) => fields,
            _ => {
                return Err(CoreError::Structural {
                    detail: describe(&structural.violations),
                })
            }
        };

        let mut envelope = ResponseEnvelope::new();
        envelope.set_field(Field::Analysis, fields.analysis)?;
        envelope.set_field(Field::Commentary, fields.commentary)?;

        if fields.code.trim().is_empty() {
            envelope.set_field(Field::Code, fields.code)?;
        } else {
            let code_result = self.validator.code(&fields.code);
            if code_result.is_fatal {
                // Discard the whole envelope: all-or-nothing.
                envelope.discard()?;
                let is_security = code_result
                    .violations
                    .iter()
                    .any(|v| v.kind == crate::validation::ViolationKind::Security);
                let detail = describe(&code_result.violations);
                return Err(if is_security {
                    CoreError::Security { detail }
                } else {
                    CoreError::Syntax { detail }
                });
            }
            let code = code_result
                .repaired_content
                .unwrap_or(fields.code);
            envelope.set_field(Field::Code, code)?;
        }

        envelope.freeze()?;
        Ok(envelope)
    }
}

fn describe(violations: &[crate::validation::Violation]) -> String {
    if violations.is_empty() {
        return "no detail".into();
    }
    violations
        .iter()
        .map(|v| v.detail.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
