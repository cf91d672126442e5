//! sluice-script: the restricted analysis language executed inside the
//! sandbox.
//!
//! The crate provides:
//! - A pest-backed parser ([`parser::parse`], [`parser::check`]) producing a
//!   line-tagged AST
//! - A bounded tree-walking interpreter ([`interp::Interpreter`]) with a
//!   step budget and cooperative cancellation
//! - Runtime values ([`value::RuntimeValue`]) and the closed
//!   transmission-safe shape set ([`value::SerializedValue`])
//!
//! The crate is deliberately I/O free: `print` output is captured and
//! returned, and the only ambient capability a script gets is whatever the
//! caller binds into its [`value::Namespace`] beforehand.

pub mod ast;
pub mod error;
pub mod interp;
pub mod parser;
pub mod value;

pub use error::{ScriptError, ScriptResult};
pub use interp::{format_value, Interpreter, InterpreterConfig, ALLOWED_MODULES};
pub use value::{ChartSpec, Namespace, RuntimeValue, SerializedValue, Table};
