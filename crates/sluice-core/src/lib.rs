//! Sluice core library
//!
//! Validated, streaming mediation between a text-generating model and a
//! restricted script executor: validation with auto-repair, transmission-
//! safe serialization with chart dedup, atomic response management,
//! delta-based streaming, and per-component circuit breakers, wired
//! together by the turn orchestrator.

pub mod breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod response;
pub mod sandbox;
pub mod serialize;
pub mod stream;
pub mod telemetry;
pub mod turn;
pub mod validation;

pub use breaker::{BreakerConfig, BreakerRegistry, Component, ComponentHealth, HealthState};
pub use config::{CoreConfig, RepairConfig};
pub use domain::{
    EnvelopeState, ExecutionErrorRecord, ExecutionResult, ExecutionStatus, Field, ResponseEnvelope,
};
pub use error::{CoreError, CoreResult, ExecutionError};
pub use model::{
    ChatMessage, ChatRequest, DeltaStream, HttpModelClient, MockModelClient, ModelClient,
    ModelConfig,
};
pub use response::{CollectionConfig, ResponseManager, ResponseState};
pub use sandbox::{Executor, SandboxConfig, ScriptExecutor};
pub use serialize::{extract_results, serialize_value, ResultSet, SerializeConfig};
pub use stream::{FinalEnvelope, StreamEvent, StreamingConfig, StreamingController};
pub use turn::{Orchestrator, TurnId};
pub use validation::{
    validate_code, validate_envelope, validate_security, CodePatch, ValidationResult, Validator,
    Violation, ViolationKind,
};
