//! Structured observability hooks for turn lifecycle events.
//!
//! This module provides:
//! - The turn-scoped tracing span built by [`turn_span`], attached to the
//!   pipeline future with `tracing::Instrument`
//! - Emission functions for key lifecycle events: turn start/finish,
//!   validation repair, execution, breaker transitions
//!
//! Events are emitted at `info!` level (configurable via `RUST_LOG`).
//! For JSON output, pass `json = true` to [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

/// Span covering one turn. Attach it to the pipeline future with
/// `Instrument` rather than holding an entered guard across await points.
pub fn turn_span(turn_id: &str) -> tracing::Span {
    tracing::info_span!("sluice.turn", turn_id = %turn_id)
}

/// Emit event: turn started with the user query length.
pub fn emit_turn_started(turn_id: &str, query_chars: usize, has_data: bool) {
    info!(event = "turn.started", turn_id = %turn_id, query_chars = query_chars, has_data = has_data);
}

/// Emit event: turn finished with duration and outcome.
pub fn emit_turn_finished(turn_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "turn.finished",
        turn_id = %turn_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: turn cancelled before completion.
pub fn emit_turn_cancelled(turn_id: &str) {
    warn!(event = "turn.cancelled", turn_id = %turn_id);
}

/// Emit event: a validation pass repaired a field.
pub fn emit_validation_repaired(field: &str, violations: usize) {
    info!(event = "validation.repaired", field = %field, violations = violations);
}

/// Emit event: a validation pass hit a fatal violation (warning level).
pub fn emit_validation_fatal(field: &str, detail: &str) {
    warn!(event = "validation.fatal", field = %field, detail = %detail);
}

/// Emit event: the envelope is being re-collected after fatal validation.
pub fn emit_recollection(turn_id: &str, attempt: u32, max_attempts: u32) {
    warn!(event = "response.recollect", turn_id = %turn_id, attempt = attempt, max_attempts = max_attempts);
}

/// Emit event: sandboxed execution finished.
pub fn emit_execution_finished(turn_id: &str, duration_ms: u64, success: bool, named_values: usize) {
    info!(
        event = "execution.finished",
        turn_id = %turn_id,
        duration_ms = duration_ms,
        success = success,
        named_values = named_values,
    );
}

/// Emit event: a circuit opened after consecutive failures.
pub fn emit_breaker_opened(component: &str, consecutive_failures: u32) {
    warn!(
        event = "breaker.opened",
        component = %component,
        consecutive_failures = consecutive_failures,
    );
}

/// Emit event: a probe call is flowing through a recovering circuit.
pub fn emit_breaker_probe(component: &str) {
    info!(event = "breaker.probe", component = %component);
}

/// Emit event: a probe succeeded and the circuit closed.
pub fn emit_breaker_closed(component: &str) {
    info!(event = "breaker.closed", component = %component);
}

/// Emit event: a call was rejected because the circuit is open.
pub fn emit_breaker_rejected(component: &str) {
    warn!(event = "breaker.rejected", component = %component);
}
