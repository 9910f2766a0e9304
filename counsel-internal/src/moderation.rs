//! Content screening for questions and answers.
//!
//! Input screening runs before any cache lookup or upstream spend. Output
//! screening redacts whole sentences rather than rejecting the answer, and the
//! legal-context check only produces warnings for the logs.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Appended to every answer that does not already carry it.
pub const LEGAL_DISCLAIMER: &str = "Disclaimer: This information is for general educational purposes only and does not constitute legal advice. For advice about your specific situation, consult a licensed attorney in your jurisdiction.";

const DISCLAIMER_MARKERS: &[&str] = &["does not constitute legal advice", "not legal advice"];

/// Categories that can be flagged by the moderation guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModerationCategory {
    Illegal,
    Violence,
    SelfHarm,
    OutcomeGuarantee,
    AttorneyRelationship,
    RegulatedAdvice,
}

impl ModerationCategory {
    /// Message shown to the user when their question is blocked
    fn block_reason(&self) -> &'static str {
        match self {
            ModerationCategory::Illegal => {
                "We can't help with requests to break the law. Please rephrase your question around your legal rights or obligations."
            }
            ModerationCategory::Violence => {
                "We can't help with requests involving harm to others."
            }
            ModerationCategory::SelfHarm => {
                "We can't help with this request. If you are in crisis, please contact local emergency services or a crisis hotline right away."
            }
            _ => "This request can't be processed.",
        }
    }

    /// Replacement text for a redacted sentence of an answer
    fn redaction(&self) -> &'static str {
        match self {
            ModerationCategory::OutcomeGuarantee => {
                "[Removed: no outcome of a legal matter can be guaranteed.]"
            }
            ModerationCategory::AttorneyRelationship => {
                "[Removed: this service does not create an attorney-client relationship.]"
            }
            _ => "[Removed: content not permitted.]",
        }
    }
}

// Phrases that turn a topic into a request for help doing it
const INTENT: &str = r"\b(?:how (?:do|can|could|should|would) i|how to|help me|teach me|show me how to|best way to|ways to|easiest way to)\b.{0,40}?";

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            tracing::error!("Invalid moderation pattern `{pattern}`: {e}");
            None
        }
    }
}

fn compile_all(patterns: &[(ModerationCategory, String)]) -> Vec<(ModerationCategory, Regex)> {
    patterns
        .iter()
        .filter_map(|(category, pattern)| compile(pattern).map(|regex| (*category, regex)))
        .collect()
}

/// Wraps a phrase so the match spans the sentence containing it. Leading
/// whitespace and earlier redactions (which end in `]`) stay outside the match.
fn sentence(phrase: &str) -> String {
    format!(r"(?i)(?:[^.!?\n\]\s][^.!?\n\]]*)?(?:{phrase})[^.!?\n\]]*[.!?]?")
}

lazy_static! {
    static ref INPUT_PATTERNS: Vec<(ModerationCategory, Regex)> = {
        use ModerationCategory::*;
        let with_intent = |p: &str| format!("(?i){INTENT}(?:{p})");
        compile_all(&[
            (Illegal, with_intent(r"\b(?:evade|escape|outrun|hide from)\s+(?:the\s+)?(?:police|cops|law enforcement|arrest|warrant)")),
            (Illegal, with_intent(r"\blaunder\w*\s+(?:the\s+|my\s+)?(?:money|funds|cash|proceeds)")),
            (Illegal, with_intent(r"\b(?:forge|fake|falsify|counterfeit)\s+(?:a\s+|an\s+|the\s+|my\s+|his\s+|her\s+)?(?:documents?|signatures?|wills?|deeds?|checks?|contracts?|ids?|passports?|receipts?)\b")),
            (Illegal, with_intent(r"\b(?:fabricate|fake|plant|destroy|tamper with)\s+(?:the\s+|some\s+)?evidence")),
            (Illegal, with_intent(r"\bbribe\s+(?:a\s+|the\s+)?(?:judge|official|officer|cop|police|juror|witness|inspector)")),
            (Illegal, with_intent(r"\bhide\s+(?:my\s+|the\s+|our\s+)?(?:assets|money|income)\s+from\s+(?:a\s+|the\s+|my\s+)?(?:court|creditors|irs|spouse|bankruptcy trustee)")),
            (Illegal, with_intent(r"\b(?:evade|cheat on)\s+(?:paying\s+|my\s+)?taxes")),
            (Violence, with_intent(r"\b(?:kill|murder|poison|assault|beat up|hurt|stab|shoot)\s+(?:someone|somebody|him|her|them|a\s+person|my\s+\w+|the\s+\w+)")),
            (Violence, r"(?i)\b(?:hire|find)\s+(?:a\s+)?hit\s?man\b".to_string()),
            (SelfHarm, r"(?i)\b(?:kill myself|end my life|commit suicide|hurt myself|harm myself)\b".to_string()),
        ])
    };

    static ref OUTPUT_PATTERNS: Vec<(ModerationCategory, Regex)> = {
        use ModerationCategory::*;
        compile_all(&[
            (OutcomeGuarantee, sentence(r"\b(?:i|we)\s+(?:can\s+)?guarantee\b")),
            (OutcomeGuarantee, sentence(r"\bguaranteed\s+(?:to\s+win|win|outcome|victory|success|result)")),
            (OutcomeGuarantee, sentence(r"\byou\s+(?:will|are going to)\s+(?:definitely|certainly|surely|absolutely)\s+(?:win|prevail|succeed)")),
            (OutcomeGuarantee, sentence(r"\b100%\s+(?:chance|certain|guaranteed)")),
            (AttorneyRelationship, sentence(r"\b(?:i am|i'm)\s+(?:your|an?)\s+(?:attorney|lawyer|legal counsel)\b")),
            (AttorneyRelationship, sentence(r"\battorney[- ]client relationship\s+(?:is|has been)\s+(?:now\s+)?(?:formed|established|created)")),
            (AttorneyRelationship, sentence(r"\bi\s+(?:will|can)\s+represent\s+you\b")),
            (Illegal, sentence(r"\b(?:here'?s how to|you (?:can|should))\s+(?:launder|forge|falsify|bribe|evade|fabricate)\b")),
        ])
    };

    static ref CONTEXT_PATTERNS: Vec<(Regex, &'static str)> = [
        (r"(?i)\byou (?:must|should definitely|need to immediately)\b", "Answer uses directive language"),
        (r"(?i)\bmy (?:legal )?advice (?:is|would be)\b", "Answer presents itself as legal advice"),
        (r"(?i)\b(?:this is|constitutes) legal advice\b", "Answer presents itself as legal advice"),
        (r"(?i)\b(?:sue|file a lawsuit against) (?:them|him|her|your \w+) (?:now|immediately|right away)\b", "Answer urges immediate litigation"),
    ]
    .iter()
    .filter_map(|(pattern, warning)| compile(pattern).map(|regex| (regex, *warning)))
    .collect();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputVerdict {
    pub blocked: bool,
    pub reason: Option<String>,
    pub category: Option<ModerationCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputVerdict {
    /// Redacted replacement; `None` means the original answer is used unchanged
    pub filtered: Option<String>,
    pub categories: Vec<ModerationCategory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegalContext {
    pub appropriate: bool,
    pub warnings: Vec<String>,
}

/// Screens a sanitized question for disallowed categories.
pub fn moderate_input(text: &str) -> InputVerdict {
    match INPUT_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
    {
        Some((category, _)) => InputVerdict {
            blocked: true,
            reason: Some(category.block_reason().to_string()),
            category: Some(*category),
        },
        None => InputVerdict {
            blocked: false,
            reason: None,
            category: None,
        },
    }
}

/// Redacts sentences that guarantee outcomes, claim representation, or instruct illegal acts.
pub fn moderate_output(answer: &str) -> OutputVerdict {
    let mut filtered = answer.to_string();
    let mut categories = Vec::new();
    for (category, pattern) in OUTPUT_PATTERNS.iter() {
        if pattern.is_match(&filtered) {
            filtered = pattern
                .replace_all(&filtered, category.redaction())
                .into_owned();
            if !categories.contains(category) {
                categories.push(*category);
            }
        }
    }
    if categories.is_empty() {
        OutputVerdict::default()
    } else {
        OutputVerdict {
            filtered: Some(filtered.trim().to_string()),
            categories,
        }
    }
}

/// Flags answers that drift from informational framing into advice.
pub fn check_legal_context(answer: &str) -> LegalContext {
    let mut warnings: Vec<String> = Vec::new();
    for (pattern, warning) in CONTEXT_PATTERNS.iter() {
        if pattern.is_match(answer) && !warnings.iter().any(|w| w == warning) {
            warnings.push((*warning).to_string());
        }
    }
    LegalContext {
        appropriate: warnings.is_empty(),
        warnings,
    }
}

pub fn has_legal_disclaimer(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    DISCLAIMER_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Appends [`LEGAL_DISCLAIMER`] unless the text already carries one. Idempotent.
pub fn ensure_legal_disclaimer(answer: &str) -> String {
    if has_legal_disclaimer(answer) {
        return answer.to_string();
    }
    let trimmed = answer.trim_end();
    if trimmed.is_empty() {
        LEGAL_DISCLAIMER.to_string()
    } else {
        format!("{trimmed}\n\n{LEGAL_DISCLAIMER}")
    }
}
