//! Core domain types shared across the pipeline.

pub mod envelope;
pub mod execution;

pub use envelope::{EnvelopeState, Field, ResponseEnvelope};
pub use execution::{ExecutionErrorRecord, ExecutionResult, ExecutionStatus};
