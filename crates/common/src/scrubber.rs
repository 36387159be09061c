//! Literal scrubbing for SQL that ends up in logs.
//!
//! Query text is logged at debug level by the scheduler; literal values may
//! carry customer data, so quoted strings and long digit runs are masked.
//! This is regex based and therefore best-effort.

use once_cell::sync::Lazy;
use regex::Regex;

static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal pattern"));

static LONG_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{6,}\b").expect("valid number pattern"));

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").expect("valid email pattern")
});

/// Mask literal values in SQL text.
pub fn scrub_sql(input: &str) -> String {
    let scrubbed = STRING_LITERAL.replace_all(input, "'***'");
    let scrubbed = EMAIL.replace_all(&scrubbed, "[EMAIL]");
    LONG_NUMBER.replace_all(&scrubbed, "[NUM]").into_owned()
}

/// Shorten text for log lines, respecting char boundaries.
pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push('…');
    out
}
