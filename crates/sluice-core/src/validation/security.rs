//! Security validation of generated code.
//!
//! Runs only on syntactically valid code. Denied capabilities — process and
//! OS control, dynamic evaluation, network access, filesystem access, and
//! imports outside the interpreter allow-list — are fatal on sight. There
//! is no repair path: rewriting unsafe code into safe code is not this
//! layer's job.

use std::sync::OnceLock;

use regex::Regex;
use sluice_script::ALLOWED_MODULES;

use super::result::{ValidationResult, Violation, ViolationKind};

struct DenyRule {
    pattern: &'static str,
    reason: &'static str,
}

/// Identifier patterns that are denied wherever they appear outside string
/// literals and comments.
const DENY_RULES: &[DenyRule] = &[
    DenyRule {
        pattern: r"\b(eval|exec|compile|spawn|system|shell|getattr|setattr)\s*\(",
        reason: "dynamic evaluation / process control",
    },
    DenyRule {
        pattern: r"\b(open|read_file|write_file|remove|unlink|rmdir|mkdir)\s*\(",
        reason: "filesystem access",
    },
    DenyRule {
        pattern: r"\b(socket|connect|fetch|request|download|upload|urlopen)\s*\(",
        reason: "network access",
    },
    DenyRule {
        pattern: r"\b(os|sys|subprocess|process|env)\s*\.",
        reason: "OS / environment access",
    },
    DenyRule {
        pattern: r"__\w+__",
        reason: "reserved dunder identifier",
    },
];

fn compiled_rules() -> &'static Vec<(Regex, &'static str)> {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        DENY_RULES
            .iter()
            .filter_map(|rule| Regex::new(rule.pattern).ok().map(|re| (re, rule.reason)))
            .collect()
    })
}

fn import_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*import\s+(\w+)").ok())
        .as_ref()
}

/// Scan `code` for denied capabilities. Always valid or fatal, never
/// repaired.
pub fn validate_security(code: &str) -> ValidationResult {
    let scannable = blank_strings_and_comments(code);
    let mut violations = Vec::new();

    for (re, reason) in compiled_rules() {
        if let Some(found) = re.find(&scannable) {
            violations.push(Violation::new(
                ViolationKind::Security,
                format!("denied identifier `{}` ({reason})", found.as_str().trim_end()),
            ));
        }
    }

    if let Some(re) = import_re() {
        for cap in re.captures_iter(&scannable) {
            if let Some(module) = cap.get(1) {
                if !ALLOWED_MODULES.contains(&module.as_str()) {
                    violations.push(Violation::new(
                        ViolationKind::Security,
                        format!("denied import `{}`", module.as_str()),
                    ));
                }
            }
        }
    }

    if violations.is_empty() {
        ValidationResult::valid()
    } else {
        ValidationResult::fatal(violations)
    }
}

/// Replace string-literal and comment contents with spaces so the denylist
/// never fires on prose.
fn blank_strings_and_comments(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut quote: Option<char> = None;
    let mut in_comment = false;
    let mut escaped = false;
    for ch in code.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
                out.push(' ');
            } else if ch == '\\' {
                escaped = true;
                out.push(' ');
            } else if ch == q {
                quote = None;
                out.push(ch);
            } else {
                out.push(if ch == '\n' { '\n' } else { ' ' });
            }
        } else if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            out.push(if ch == '\n' { '\n' } else { ' ' });
        } else {
            match ch {
                '"' | '\'' => quote = Some(ch),
                '#' => {
                    in_comment = true;
                    out.push(' ');
                    continue;
                }
                _ => {}
            }
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_code_passes() {
        let result = validate_security("import tables\nx = sum([1, 2])\nprint(x)");
        assert!(result.is_valid);
    }

    #[test]
    fn test_dynamic_evaluation_is_fatal() {
        let result = validate_security("eval(\"1 + 1\")");
        assert!(result.is_fatal);
        assert_eq!(result.violations[0].kind, ViolationKind::Security);
    }

    #[test]
    fn test_filesystem_access_is_fatal() {
        assert!(validate_security("f = open(\"secrets.txt\")").is_fatal);
    }

    #[test]
    fn test_network_access_is_fatal() {
        assert!(validate_security("r = fetch(\"http://example.com\")").is_fatal);
    }

    #[test]
    fn test_denied_import_is_fatal() {
        let result = validate_security("import os");
        assert!(result.is_fatal);
        assert!(result.violations[0].detail.contains("os"));
    }

    #[test]
    fn test_allowed_import_passes() {
        assert!(validate_security("import charts").is_valid);
    }

    #[test]
    fn test_denied_word_inside_string_is_ignored() {
        let result = validate_security("note = \"we never call eval( here\"");
        assert!(result.is_valid);
    }

    #[test]
    fn test_denied_word_inside_comment_is_ignored() {
        assert!(validate_security("x = 1  # not exec( anything").is_valid);
    }

    #[test]
    fn test_never_repaired() {
        let result = validate_security("import os");
        assert!(result.repaired_content.is_none());
    }
}
