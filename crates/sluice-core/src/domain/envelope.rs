//! The three-field response envelope and its lifecycle.
//!
//! An envelope is all-or-nothing: partial content is never released. The
//! lifecycle is empty → collecting → frozen → released | discarded |
//! abandoned, and every transition is checked — an illegal transition is a
//! bug in the caller, reported as an error rather than silently accepted.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// The three text fields of a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Analysis,
    Code,
    Commentary,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Analysis, Field::Code, Field::Commentary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Analysis => "analysis",
            Field::Code => "code",
            Field::Commentary => "commentary",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a [`ResponseEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    Empty,
    Collecting,
    Frozen,
    Released,
    Discarded,
    Abandoned,
}

impl EnvelopeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnvelopeState::Released | EnvelopeState::Discarded | EnvelopeState::Abandoned
        )
    }
}

/// A model response under collection and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    analysis: String,
    code: String,
    commentary: String,
    state: EnvelopeState,
}

impl Default for ResponseEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseEnvelope {
    pub fn new() -> Self {
        Self {
            analysis: String::new(),
            code: String::new(),
            commentary: String::new(),
            state: EnvelopeState::Empty,
        }
    }

    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Analysis => &self.analysis,
            Field::Code => &self.code,
            Field::Commentary => &self.commentary,
        }
    }

    /// Append streamed delta text to a field while collecting.
    pub fn append(&mut self, field: Field, delta: &str) -> CoreResult<()> {
        match self.state {
            EnvelopeState::Empty | EnvelopeState::Collecting => {
                self.state = EnvelopeState::Collecting;
                self.field_mut(field).push_str(delta);
                Ok(())
            }
            other => Err(illegal(other, "append")),
        }
    }

    /// Replace a field's full content, e.g. with repaired text from
    /// validation. Allowed until the envelope is frozen.
    pub fn set_field(&mut self, field: Field, text: String) -> CoreResult<()> {
        match self.state {
            EnvelopeState::Empty | EnvelopeState::Collecting => {
                self.state = EnvelopeState::Collecting;
                *self.field_mut(field) = text;
                Ok(())
            }
            other => Err(illegal(other, "set_field")),
        }
    }

    /// Freeze the envelope: content is now immutable and may be released.
    pub fn freeze(&mut self) -> CoreResult<()> {
        match self.state {
            EnvelopeState::Collecting => {
                self.state = EnvelopeState::Frozen;
                Ok(())
            }
            other => Err(illegal(other, "freeze")),
        }
    }

    /// Release the envelope for streaming. Only a frozen envelope — fully
    /// collected and validated — can be released.
    pub fn release(&mut self) -> CoreResult<()> {
        match self.state {
            EnvelopeState::Frozen => {
                self.state = EnvelopeState::Released;
                Ok(())
            }
            other => Err(illegal(other, "release")),
        }
    }

    /// Discard the envelope after a fatal validation failure. Content is
    /// cleared so nothing partial can leak out later.
    pub fn discard(&mut self) -> CoreResult<()> {
        if self.state.is_terminal() {
            return Err(illegal(self.state, "discard"));
        }
        self.clear();
        self.state = EnvelopeState::Discarded;
        Ok(())
    }

    /// Abandon the envelope on turn cancellation. Like discard, but records
    /// that the turn ended by cancellation rather than by failure.
    pub fn abandon(&mut self) -> CoreResult<()> {
        if self.state.is_terminal() {
            return Err(illegal(self.state, "abandon"));
        }
        self.clear();
        self.state = EnvelopeState::Abandoned;
        Ok(())
    }

    fn clear(&mut self) {
        self.analysis.clear();
        self.code.clear();
        self.commentary.clear();
    }

    fn field_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::Analysis => &mut self.analysis,
            Field::Code => &mut self.code,
            Field::Commentary => &mut self.commentary,
        }
    }
}

fn illegal(state: EnvelopeState, operation: &str) -> CoreError {
    CoreError::Structural {
        detail: format!("illegal envelope operation `{operation}` in state {state:?}"),
    }
}
