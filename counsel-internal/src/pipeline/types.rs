use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::inference::types::ChatMessage;
use crate::plan::PlanTier;
use crate::prompt::Category;

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub question: String,
    pub answer: String,
    pub confidence: f64,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub confidence: f64,
    pub model: String,
}

/// The caller's question count for today. `limit` and `remaining` are absent on
/// unlimited plans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub plan: PlanTier,
    pub used: u32,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
}

/// One server-sent event of `/api/ai/stream`. The variant name is the SSE event name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Delta {
        text: String,
    },
    Done {
        answer: String,
        confidence: f64,
        model: String,
        cached: bool,
    },
    Error {
        error: String,
        code: ErrorCode,
    },
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// The answer produced by the pipeline before it is shaped into a response body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Answer {
    /// The sanitized question
    pub question: String,
    /// Moderated answer with the legal disclaimer
    pub content: String,
    pub confidence: f64,
    pub model: String,
    pub cached: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
}
