//! Syntax validation and repair of generated code.
//!
//! The code field must parse as a script. When it does not, a small set of
//! repair patches targets the corruption classes models actually produce:
//! a stray line continuation after an already-balanced statement, unclosed
//! brackets, and stray backslashes inside string literals. Patches are
//! applied cumulatively in configurable order, re-parsing after each; the
//! first successful parse wins and exhausting the patch list is fatal.

use serde::{Deserialize, Serialize};
use sluice_script::parser;

use super::result::{ValidationResult, Violation, ViolationKind};

/// One repair patch. The order they run in is configuration, not code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePatch {
    /// Remove a trailing `\` that ends an already-balanced statement.
    StripTrailingContinuation,
    /// Append closers for brackets left open outside strings and comments.
    CloseBrackets,
    /// Drop a `\` inside a string literal that starts no recognized escape.
    DropStrayEscapes,
}

impl CodePatch {
    fn apply(&self, code: &str) -> String {
        match self {
            CodePatch::StripTrailingContinuation => strip_trailing_continuation(code),
            CodePatch::CloseBrackets => close_brackets(code),
            CodePatch::DropStrayEscapes => drop_stray_escapes(code),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            CodePatch::StripTrailingContinuation => "stripped trailing line continuation",
            CodePatch::CloseBrackets => "closed unbalanced brackets",
            CodePatch::DropStrayEscapes => "dropped stray string escapes",
        }
    }
}

pub const DEFAULT_PATCH_ORDER: [CodePatch; 3] = [
    CodePatch::StripTrailingContinuation,
    CodePatch::CloseBrackets,
    CodePatch::DropStrayEscapes,
];

/// Parse `code`, repairing with `patch_order` on failure.
pub fn validate_code(code: &str, patch_order: &[CodePatch]) -> ValidationResult {
    let first_error = match parser::check(code) {
        Ok(()) => return ValidationResult::valid(),
        Err(err) => err,
    };

    let mut violations = vec![Violation::new(ViolationKind::Syntax, first_error.to_string())];
    let mut current = code.to_string();
    for patch in patch_order {
        let patched = patch.apply(&current);
        if patched == current {
            continue;
        }
        violations.push(Violation::new(ViolationKind::Syntax, patch.describe()));
        current = patched;
        if parser::check(&current).is_ok() {
            return ValidationResult::repaired(current, violations);
        }
    }
    ValidationResult::fatal(violations)
}

/// Per-character scan state shared by the patches: are we inside a string
/// or comment, and which brackets are open.
struct CodeScan {
    chars: Vec<char>,
}

#[derive(Clone, Copy, PartialEq)]
enum Ctx {
    Code,
    Str(char),
    Comment,
}

impl CodeScan {
    fn new(code: &str) -> Self {
        Self {
            chars: code.chars().collect(),
        }
    }

    /// Context and open-bracket depth at every character position.
    fn contexts(&self) -> Vec<(Ctx, usize)> {
        let mut out = Vec::with_capacity(self.chars.len());
        let mut ctx = Ctx::Code;
        let mut depth = 0usize;
        let mut escaped = false;
        for &ch in &self.chars {
            out.push((ctx, depth));
            match ctx {
                Ctx::Str(quote) => {
                    if escaped {
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == quote {
                        ctx = Ctx::Code;
                    }
                }
                Ctx::Comment => {
                    if ch == '\n' {
                        ctx = Ctx::Code;
                    }
                }
                Ctx::Code => match ch {
                    '"' | '\'' => ctx = Ctx::Str(ch),
                    '#' => ctx = Ctx::Comment,
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' | '}' => depth = depth.saturating_sub(1),
                    _ => {}
                },
            }
        }
        out
    }
}

/// Drop `\` at end-of-line when the statement it ends is already balanced,
/// and a `\` dangling at end of input.
fn strip_trailing_continuation(code: &str) -> String {
    let scan = CodeScan::new(code);
    let contexts = scan.contexts();
    let mut out = String::with_capacity(code.len());
    for (i, &ch) in scan.chars.iter().enumerate() {
        let (ctx, depth) = contexts[i];
        if ch == '\\' && ctx == Ctx::Code && depth == 0 {
            let rest_blank = scan.chars[i + 1..]
                .iter()
                .take_while(|&&c| c != '\n')
                .all(|c| c.is_whitespace());
            if rest_blank {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Append closers, innermost first, for brackets still open at end of input.
fn close_brackets(code: &str) -> String {
    let mut open: Vec<char> = Vec::new();
    let mut ctx = Ctx::Code;
    let mut escaped = false;
    for ch in code.chars() {
        match ctx {
            Ctx::Str(quote) => {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == quote {
                    ctx = Ctx::Code;
                }
            }
            Ctx::Comment => {
                if ch == '\n' {
                    ctx = Ctx::Code;
                }
            }
            Ctx::Code => match ch {
                '"' | '\'' => ctx = Ctx::Str(ch),
                '#' => ctx = Ctx::Comment,
                '(' | '[' | '{' => open.push(ch),
                ')' | ']' | '}' => {
                    open.pop();
                }
                _ => {}
            },
        }
    }
    if open.is_empty() {
        return code.to_string();
    }
    let mut out = code.trim_end().to_string();
    // A continuation right before the closers would swallow them.
    while out.ends_with('\\') {
        out.pop();
    }
    out.truncate(out.trim_end().len());
    for opener in open.iter().rev() {
        out.push(match opener {
            '(' => ')',
            '[' => ']',
            _ => '}',
        });
    }
    out
}

/// Inside string literals, drop a `\` that precedes no recognized escape
/// character.
fn drop_stray_escapes(code: &str) -> String {
    const RECOGNIZED: [char; 5] = ['n', 't', 'r', '\\', '"'];
    let mut out = String::with_capacity(code.len());
    let mut ctx = Ctx::Code;
    let chars: Vec<char> = code.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ctx {
            Ctx::Str(quote) => {
                if ch == '\\' {
                    match chars.get(i + 1) {
                        Some(&next) if RECOGNIZED.contains(&next) || next == quote => {
                            out.push(ch);
                            out.push(next);
                            i += 2;
                            continue;
                        }
                        _ => {
                            // Stray: drop the backslash, keep what follows.
                            i += 1;
                            continue;
                        }
                    }
                }
                if ch == quote {
                    ctx = Ctx::Code;
                }
                out.push(ch);
            }
            Ctx::Comment => {
                if ch == '\n' {
                    ctx = Ctx::Code;
                }
                out.push(ch);
            }
            Ctx::Code => {
                match ch {
                    '"' | '\'' => ctx = Ctx::Str(ch),
                    '#' => ctx = Ctx::Comment,
                    _ => {}
                }
                out.push(ch);
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_code_is_valid() {
        let result = validate_code("x = 1\nprint(x)", &DEFAULT_PATCH_ORDER);
        assert!(result.is_valid);
        assert!(result.repaired_content.is_none());
    }

    #[test]
    fn test_trailing_continuation_is_stripped() {
        let result = validate_code("x = 1 + 2 \\\nprint(x)", &DEFAULT_PATCH_ORDER);
        assert!(result.is_valid, "violations: {:?}", result.violations);
        assert_eq!(result.repaired_content.as_deref(), Some("x = 1 + 2 \nprint(x)"));
    }

    #[test]
    fn test_unbalanced_bracket_is_closed() {
        let result = validate_code("x = [1, 2, 3", &DEFAULT_PATCH_ORDER);
        assert!(result.is_valid, "violations: {:?}", result.violations);
        assert_eq!(result.repaired_content.as_deref(), Some("x = [1, 2, 3]"));
    }

    #[test]
    fn test_stray_escape_is_dropped() {
        let result = validate_code("s = \"hello \\world\"", &DEFAULT_PATCH_ORDER);
        assert!(result.is_valid, "violations: {:?}", result.violations);
        assert_eq!(result.repaired_content.as_deref(), Some("s = \"hello world\""));
    }

    #[test]
    fn test_combined_corruption_is_repaired() {
        // Trailing continuation plus an unclosed list on one statement.
        let result = validate_code("x = [1, 2 \\", &DEFAULT_PATCH_ORDER);
        assert!(result.is_valid, "violations: {:?}", result.violations);
        let repaired = result.repaired_content.unwrap();
        assert_eq!(repaired, "x = [1, 2]");
        assert!(parser::check(&repaired).is_ok());
    }

    #[test]
    fn test_mismatched_closer_with_continuation_is_fatal() {
        // The `}` closes nothing, so even after the continuation strips the
        // brackets balance out and no patch brings the code to a parse.
        // Same input must land on the same outcome every time.
        for _ in 0..3 {
            let result = validate_code("x = [1,2,}\\", &DEFAULT_PATCH_ORDER);
            assert!(result.is_fatal, "violations: {:?}", result.violations);
            assert!(result.repaired_content.is_none());
        }
    }

    #[test]
    fn test_unrepairable_code_is_fatal() {
        let result = validate_code("x = = = 1", &DEFAULT_PATCH_ORDER);
        assert!(result.is_fatal);
        assert!(!result.violations.is_empty());
    }

    #[test]
    fn test_recognized_escapes_survive() {
        let result = validate_code("s = \"line\\none\"", &DEFAULT_PATCH_ORDER);
        assert!(result.is_valid);
        assert!(result.repaired_content.is_none());
    }

    #[test]
    fn test_patch_order_is_respected() {
        // With only CloseBrackets configured, a stray escape stays fatal.
        let result = validate_code("s = \"a \\q b\"", &[CodePatch::CloseBrackets]);
        assert!(result.is_fatal);
        let result = validate_code("s = \"a \\q b\"", &[CodePatch::DropStrayEscapes]);
        assert!(result.is_valid);
    }
}
