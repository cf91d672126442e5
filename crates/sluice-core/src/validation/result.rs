//! The outcome of a single validation pass.

use serde::{Deserialize, Serialize};

/// Which pass flagged a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Structural,
    Syntax,
    Security,
}

/// One recorded violation, whether repaired or fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Produced fresh by every validation pass; never mutated after the pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Repaired text, present only when a repair was applied and succeeded.
    pub repaired_content: Option<String>,
    pub violations: Vec<Violation>,
    /// Fatal results cannot be repaired; the envelope must be discarded or
    /// re-collected.
    pub is_fatal: bool,
}

impl ValidationResult {
    /// Content passed untouched.
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            repaired_content: None,
            violations: Vec::new(),
            is_fatal: false,
        }
    }

    /// Content passed after repair; `violations` records what was fixed.
    pub fn repaired(content: String, violations: Vec<Violation>) -> Self {
        Self {
            is_valid: true,
            repaired_content: Some(content),
            violations,
            is_fatal: false,
        }
    }

    /// Content failed beyond repair.
    pub fn fatal(violations: Vec<Violation>) -> Self {
        Self {
            is_valid: false,
            repaired_content: None,
            violations,
            is_fatal: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert!(ValidationResult::valid().is_valid);
        let repaired = ValidationResult::repaired(
            "x = 1".into(),
            vec![Violation::new(ViolationKind::Syntax, "closed bracket")],
        );
        assert!(repaired.is_valid);
        assert!(!repaired.is_fatal);
        assert_eq!(repaired.violations.len(), 1);
        let fatal = ValidationResult::fatal(vec![Violation::new(
            ViolationKind::Security,
            "denied identifier",
        )]);
        assert!(!fatal.is_valid);
        assert!(fatal.is_fatal);
    }
}
