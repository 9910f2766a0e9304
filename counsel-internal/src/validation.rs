use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SCRIPT_INJECTION_PATTERNS: Vec<Regex> = [
        r"(?i)<\s*script",
        r"(?i)javascript\s*:",
        r"(?i)<[^>]*\son[a-z]+\s*=",
        r"(?i)<\s*iframe",
        r"(?i)data\s*:\s*text/html",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub blocked: bool,
    pub reason: Option<String>,
    /// Present only when the input is accepted
    pub sanitized: Option<String>,
}

impl ValidationVerdict {
    fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            sanitized: None,
        }
    }

    fn accept(sanitized: String) -> Self {
        Self {
            blocked: false,
            reason: None,
            sanitized: Some(sanitized),
        }
    }
}

/// Trims, strips control characters, and collapses whitespace runs to a single space.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_script_injection(text: &str) -> bool {
    SCRIPT_INJECTION_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(text))
}

/// Bounds-checks and sanitizes a question. Length is counted in characters after trimming.
pub fn validate_input(text: &str, max_length: usize) -> ValidationVerdict {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ValidationVerdict::block("Question cannot be empty");
    }
    if trimmed.chars().count() > max_length {
        return ValidationVerdict::block(format!(
            "Question exceeds maximum length of {max_length} characters"
        ));
    }
    if contains_script_injection(trimmed) {
        return ValidationVerdict::block("Question contains disallowed markup");
    }
    let sanitized = sanitize(trimmed);
    if sanitized.is_empty() {
        return ValidationVerdict::block("Question cannot be empty");
    }
    ValidationVerdict::accept(sanitized)
}
