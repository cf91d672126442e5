//! Structural validation of the raw model reply.
//!
//! The reply must decode into a JSON object carrying the three envelope
//! fields. Model output drifts in predictable ways — markdown fences around
//! the object, a reply cut off mid-string, trailing commas, bare control
//! characters inside string literals — so each of those gets a targeted
//! textual patch, re-checked by a full decode after every attempt. Anything
//! the patches cannot fix is fatal.

use serde::Deserialize;

use super::result::{ValidationResult, Violation, ViolationKind};

/// The decoded three fields. Absent keys decode as empty strings; a later
/// pipeline stage decides which fields it requires.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnvelopeFields {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub commentary: String,
}

impl EnvelopeFields {
    pub fn is_empty(&self) -> bool {
        self.analysis.is_empty() && self.code.is_empty() && self.commentary.is_empty()
    }
}

/// Decode `raw` into envelope fields, repairing if necessary.
pub fn validate_envelope(raw: &str) -> (ValidationResult, Option<EnvelopeFields>) {
    let mut violations = Vec::new();

    let mut text = raw.trim().to_string();
    if let Some(inner) = strip_fences(&text) {
        violations.push(structural("stripped markdown code fences"));
        text = inner;
    }

    if let Some(fields) = decode(&text) {
        return finish(text, violations, fields, raw);
    }
    violations.push(structural("reply is not a decodable envelope object"));

    // Targeted patches, cumulative, re-decoding after each.
    let patched = drop_trailing_commas(&text);
    if patched != text {
        violations.push(structural("dropped trailing commas"));
        text = patched;
        if let Some(fields) = decode(&text) {
            return finish(text, violations, fields, raw);
        }
    }

    if has_corruption_indicators(&text) {
        let patched = escape_control_chars(&text);
        if patched != text {
            violations.push(structural("escaped bare control characters in string"));
            text = patched;
            if let Some(fields) = decode(&text) {
                return finish(text, violations, fields, raw);
            }
        }

        let patched = close_unterminated(&text);
        if patched != text {
            violations.push(structural("closed unterminated string/object"));
            text = patched;
            if let Some(fields) = decode(&text) {
                return finish(text, violations, fields, raw);
            }
        }
    }

    (ValidationResult::fatal(violations), None)
}

fn finish(
    text: String,
    violations: Vec<Violation>,
    fields: EnvelopeFields,
    raw: &str,
) -> (ValidationResult, Option<EnvelopeFields>) {
    if fields.is_empty() {
        let mut violations = violations;
        violations.push(structural("envelope carries no content in any field"));
        return (ValidationResult::fatal(violations), None);
    }
    let result = if text == raw {
        ValidationResult::valid()
    } else {
        ValidationResult::repaired(text, violations)
    };
    (result, Some(fields))
}

fn decode(text: &str) -> Option<EnvelopeFields> {
    serde_json::from_str(text).ok()
}

fn structural(detail: &str) -> Violation {
    Violation::new(ViolationKind::Structural, detail)
}

/// Strip a ```json … ``` (or bare ```) fence wrapping the whole reply.
fn strip_fences(text: &str) -> Option<String> {
    let rest = text.strip_prefix("```")?;
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    let inner = match rest.rfind("```") {
        Some(pos) => &rest[..pos],
        // Fence never closed (reply cut off); take everything after it.
        None => rest,
    };
    Some(inner.trim().to_string())
}

/// End-of-text scan state used by the repair patches.
struct JsonScan {
    in_string: bool,
    /// Unclosed `{`/`[` openers, in order.
    open: Vec<char>,
    control_in_string: bool,
    trailing_backslash: bool,
}

fn scan_json(text: &str) -> JsonScan {
    let mut scan = JsonScan {
        in_string: false,
        open: Vec::new(),
        control_in_string: false,
        trailing_backslash: false,
    };
    let mut escaped = false;
    for ch in text.chars() {
        scan.trailing_backslash = false;
        if escaped {
            escaped = false;
            continue;
        }
        if scan.in_string {
            match ch {
                '\\' => {
                    escaped = true;
                    scan.trailing_backslash = true;
                }
                '"' => scan.in_string = false,
                c if c.is_control() => scan.control_in_string = true,
                _ => {}
            }
        } else {
            match ch {
                '"' => scan.in_string = true,
                '{' | '[' => scan.open.push(ch),
                '}' => {
                    if scan.open.last() == Some(&'{') {
                        scan.open.pop();
                    }
                }
                ']' => {
                    if scan.open.last() == Some(&'[') {
                        scan.open.pop();
                    }
                }
                _ => {}
            }
        }
    }
    scan
}

/// Cheap pre-scan gating the heavier character-level repairs.
pub fn has_corruption_indicators(text: &str) -> bool {
    let scan = scan_json(text);
    scan.in_string || !scan.open.is_empty() || scan.control_in_string || scan.trailing_backslash
}

/// `"a": 1,}` → `"a": 1}` — models love trailing commas.
fn drop_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();
    for (i, &ch) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        if in_string {
            if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Replace bare control characters inside string literals with their
/// escaped forms.
fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        if in_string {
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                '\r' => out.push_str("\\r"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Close an unterminated string and any unclosed containers, so a reply cut
/// off mid-field still decodes (with the truncated field as-is).
fn close_unterminated(text: &str) -> String {
    let scan = scan_json(text);
    let mut out = text.to_string();
    if scan.trailing_backslash {
        out.pop();
    }
    let scan = scan_json(&out);
    if scan.in_string {
        out.push('"');
    }
    for opener in scan.open.iter().rev() {
        out.push(match opener {
            '{' => '}',
            _ => ']',
        });
    }
    out
}
