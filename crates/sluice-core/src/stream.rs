//! Delta-based delivery of validated content to the receiver.
//!
//! The controller keeps one position cursor per field and never re-sends
//! text a receiver already has. Frozen fields are replayed in fixed-size
//! chunks with a configurable delay; when finalized content diverges from
//! what was already streamed (validation repaired the field after partial
//! delivery), a `replace` event carries the authoritative full text and the
//! cursor restarts from its end.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{ExecutionErrorRecord, Field};
use crate::serialize::ResultSet;

/// Delivery pacing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Characters per replayed chunk.
    pub chunk_size: usize,
    /// Delay between replayed chunks (milliseconds).
    pub chunk_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 24,
            chunk_delay_ms: 10,
        }
    }
}

/// Final envelope content carried on the `end` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalEnvelope {
    pub analysis: String,
    pub code: String,
    pub commentary: String,
}

/// Events delivered to the receiver, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        turn_id: String,
    },
    Delta {
        field: Field,
        text: String,
    },
    /// Authoritative overwrite of everything sent for `field` so far.
    Replace {
        field: Field,
        text: String,
    },
    FieldComplete {
        field: Field,
    },
    ExecutionResults {
        results: ResultSet,
        captured_output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ExecutionErrorRecord>,
    },
    End {
        envelope: FinalEnvelope,
    },
    StreamError {
        kind: String,
        message: String,
    },
}

/// Sends events over a channel, tracking what each field has received.
///
/// The channel is unbounded so partial content can be surfaced from
/// synchronous collection callbacks; the receiver is an in-process
/// consumer, not a network peer.
pub struct StreamingController {
    config: StreamingConfig,
    tx: mpsc::UnboundedSender<StreamEvent>,
    /// Characters already delivered, per field.
    sent: HashMap<Field, String>,
}

impl StreamingController {
    pub fn new(config: StreamingConfig, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            config,
            tx,
            sent: HashMap::new(),
        }
    }

    pub fn start(&self, turn_id: &str) {
        self.emit(StreamEvent::Start {
            turn_id: turn_id.to_string(),
        });
    }

    /// Surface in-flight content: deliver whatever suffix of `text` has not
    /// been sent yet, in one delta. `text` must be a growing prefix stream;
    /// a shrinking or diverging partial is ignored (the frozen replay will
    /// reconcile it).
    pub fn send_partial(&mut self, field: Field, text: &str) {
        let sent = self.sent.entry(field).or_default();
        if text.len() <= sent.len() || !text.starts_with(sent.as_str()) {
            return;
        }
        let delta = text[sent.len()..].to_string();
        sent.push_str(&delta);
        self.emit(StreamEvent::Delta { field, text: delta });
    }

    /// Replay a frozen field to completion: reconcile divergence with a
    /// `replace`, chunk out the unsent remainder, then `field_complete`.
    pub async fn replay_field(&mut self, field: Field, final_text: &str) {
        let sent = self.sent.entry(field).or_default().clone();
        if !sent.is_empty() && !final_text.starts_with(sent.as_str()) {
            // Already-streamed text is stale; overwrite authoritatively.
            self.sent.insert(field, final_text.to_string());
            self.emit(StreamEvent::Replace {
                field,
                text: final_text.to_string(),
            });
            self.emit(StreamEvent::FieldComplete { field });
            return;
        }

        let mut position = sent.len();
        let delay = Duration::from_millis(self.config.chunk_delay_ms);
        let chunk_size = self.config.chunk_size.max(1);
        let remaining: Vec<char> = final_text[position..].chars().collect();
        for chunk in remaining.chunks(chunk_size) {
            let text: String = chunk.iter().collect();
            position += text.len();
            if let Some(sent) = self.sent.get_mut(&field) {
                sent.push_str(&text);
            }
            self.emit(StreamEvent::Delta { field, text });
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        debug_assert_eq!(position, final_text.len());
        self.emit(StreamEvent::FieldComplete { field });
    }

    pub fn execution_results(
        &self,
        results: ResultSet,
        captured_output: String,
        error: Option<ExecutionErrorRecord>,
    ) {
        self.emit(StreamEvent::ExecutionResults {
            results,
            captured_output,
            error,
        });
    }

    pub fn end(&self, envelope: FinalEnvelope) {
        self.emit(StreamEvent::End { envelope });
    }

    pub fn error(&self, kind: &str, message: &str) {
        self.emit(StreamEvent::StreamError {
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    fn emit(&self, event: StreamEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(chunk_size: usize) -> (StreamingController, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = StreamingConfig {
            chunk_size,
            chunk_delay_ms: 0,
        };
        (StreamingController::new(config, tx), rx)
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn concat_deltas(events: &[StreamEvent], want: Field) -> String {
        let mut out = String::new();
        for event in events {
            match event {
                StreamEvent::Delta { field, text } if *field == want => out.push_str(text),
                StreamEvent::Replace { field, text } if *field == want => out = text.clone(),
                _ => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn test_replay_chunks_reconstruct_text_exactly() {
        let (mut ctl, mut rx) = controller(5);
        let text = "twelve chars and then some";
        ctl.replay_field(Field::Analysis, text).await;
        let events = drain(&mut rx).await;
        assert_eq!(concat_deltas(&events, Field::Analysis), text);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::FieldComplete {
                field: Field::Analysis
            })
        ));
    }

    #[tokio::test]
    async fn test_partial_then_replay_never_resends() {
        let (mut ctl, mut rx) = controller(8);
        ctl.send_partial(Field::Analysis, "The data ");
        ctl.send_partial(Field::Analysis, "The data shows");
        ctl.replay_field(Field::Analysis, "The data shows a trend.").await;
        let events = drain(&mut rx).await;
        assert_eq!(
            concat_deltas(&events, Field::Analysis),
            "The data shows a trend."
        );
        // No replace should have been needed.
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::Replace { .. })));
    }

    #[tokio::test]
    async fn test_divergent_final_content_emits_replace() {
        let (mut ctl, mut rx) = controller(8);
        ctl.send_partial(Field::Code, "x = [1, 2, 3");
        // Validation repaired the field; streamed prefix is stale.
        ctl.replay_field(Field::Code, "y = 0\nx = [1, 2, 3]").await;
        let events = drain(&mut rx).await;
        let replace = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::Replace { field, text } if *field == Field::Code => Some(text.clone()),
                _ => None,
            })
            .expect("replace event");
        assert_eq!(replace, "y = 0\nx = [1, 2, 3]");
        assert_eq!(concat_deltas(&events, Field::Code), "y = 0\nx = [1, 2, 3]");
    }

    #[tokio::test]
    async fn test_repaired_suffix_streams_without_replace() {
        let (mut ctl, mut rx) = controller(100);
        ctl.send_partial(Field::Code, "x = [1, 2, 3");
        // Repair appended to the streamed prefix, so only the remainder flows.
        ctl.replay_field(Field::Code, "x = [1, 2, 3]").await;
        let events = drain(&mut rx).await;
        let deltas: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Delta { .. }))
            .collect();
        assert_eq!(deltas.len(), 2);
        match deltas[1] {
            StreamEvent::Delta { text, .. } => assert_eq!(text, "]"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_fields_have_independent_cursors() {
        let (mut ctl, mut rx) = controller(100);
        ctl.send_partial(Field::Analysis, "prose");
        ctl.replay_field(Field::Code, "x = 1").await;
        ctl.replay_field(Field::Analysis, "prose continues").await;
        let events = drain(&mut rx).await;
        assert_eq!(concat_deltas(&events, Field::Code), "x = 1");
        assert_eq!(concat_deltas(&events, Field::Analysis), "prose continues");
    }

    #[tokio::test]
    async fn test_event_wire_format() {
        let event = StreamEvent::Delta {
            field: Field::Analysis,
            text: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "delta");
        assert_eq!(json["field"], "analysis");
        assert_eq!(json["text"], "hi");
    }
}
