//! Early extraction of string fields from an in-flight reply.
//!
//! While the model is still streaming, the collector may surface a field's
//! prefix before the full envelope can be decoded. Only content that is a
//! validly decoded string prefix is ever surfaced: an escape sequence cut
//! off by the buffer edge is held back, and nothing past an unterminated
//! region is guessed at.

/// A decoded field prefix and whether its closing quote has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialField {
    pub text: String,
    pub terminated: bool,
}

/// Extract the string value of `field` from a possibly incomplete JSON
/// object in `buffer`. Returns `None` until the field's opening quote has
/// arrived.
pub fn extract_string_field(buffer: &str, field: &str) -> Option<PartialField> {
    let key = format!("\"{field}\"");
    let key_pos = buffer.find(&key)?;
    let after_key = &buffer[key_pos + key.len()..];
    let colon = after_key.find(':')?;
    let after_colon = after_key[colon + 1..].trim_start();
    let value = after_colon.strip_prefix('"')?;

    let mut text = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                return Some(PartialField {
                    text,
                    terminated: true,
                })
            }
            '\\' => match chars.next() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('r') => text.push('\r'),
                Some('"') => text.push('"'),
                Some('\\') => text.push('\\'),
                Some('/') => text.push('/'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if hex.len() < 4 {
                        // Escape cut off by the buffer edge: hold it back.
                        break;
                    }
                    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        Some(decoded) => text.push(decoded),
                        None => break,
                    }
                }
                Some(other) => {
                    // Not a JSON escape; surface it literally rather than
                    // invent content.
                    text.push(other);
                }
                None => break,
            },
            _ => text.push(ch),
        }
    }
    Some(PartialField {
        text,
        terminated: false,
    })
}
