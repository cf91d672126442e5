//! Validation and auto-repair of model output.
//!
//! Three ordered passes, each producing a fresh [`ValidationResult`]:
//! structural (the raw reply decodes into the three-field envelope), syntax
//! (generated code parses), and security (generated code touches no denied
//! capability). Structural and syntax failures are repaired with targeted
//! textual patches and re-checked; security failures are always fatal and
//! never repaired.

pub mod code;
pub mod envelope;
pub mod partial;
pub mod result;
pub mod security;

pub use code::{validate_code, CodePatch, DEFAULT_PATCH_ORDER};
pub use envelope::{validate_envelope, EnvelopeFields};
pub use partial::{extract_string_field, PartialField};
pub use result::{ValidationResult, Violation, ViolationKind};
pub use security::validate_security;

use crate::metrics::METRICS;
use crate::obs;

/// Facade bundling the passes with their configuration.
#[derive(Debug, Clone)]
pub struct Validator {
    patch_order: Vec<CodePatch>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            patch_order: DEFAULT_PATCH_ORDER.to_vec(),
        }
    }
}

impl Validator {
    pub fn new(patch_order: Vec<CodePatch>) -> Self {
        Self { patch_order }
    }

    /// Structural pass over the raw model reply.
    pub fn envelope(&self, raw: &str) -> (ValidationResult, Option<EnvelopeFields>) {
        let (result, fields) = validate_envelope(raw);
        self.account("envelope", &result);
        (result, fields)
    }

    /// Syntax pass, then — only on syntactically valid code — the security
    /// pass. A security violation is fatal regardless of syntax repair.
    pub fn code(&self, code: &str) -> ValidationResult {
        let syntax = validate_code(code, &self.patch_order);
        if syntax.is_fatal {
            self.account("code", &syntax);
            return syntax;
        }
        let checked = syntax.repaired_content.as_deref().unwrap_or(code);
        let security = validate_security(checked);
        if security.is_fatal {
            self.account("code", &security);
            return security;
        }
        self.account("code", &syntax);
        syntax
    }

    fn account(&self, field: &str, result: &ValidationResult) {
        if result.is_fatal {
            let detail = result
                .violations
                .last()
                .map(|v| v.detail.as_str())
                .unwrap_or("unknown");
            obs::emit_validation_fatal(field, detail);
        } else if result.repaired_content.is_some() {
            METRICS.inc_repairs_applied();
            obs::emit_validation_repaired(field, result.violations.len());
        }
    }
}
