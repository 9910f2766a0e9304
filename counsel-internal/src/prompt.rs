use serde::{Deserialize, Serialize};

/// Topic area of a question. Part of the cache fingerprint and selects the system prompt.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    #[default]
    General,
    Contracts,
    Rights,
    Business,
}

const BASE_SYSTEM_PROMPT: &str = "You are a legal information assistant. Explain the relevant law in plain language, \
note that rules vary by jurisdiction, and never claim to be the user's lawyer or promise any outcome. \
Provide general information only, not legal advice.";

pub fn system_prompt(category: Category) -> String {
    let focus = match category {
        Category::General => "Answer the user's general legal question.",
        Category::Contracts => {
            "Focus on contract formation, interpretation, obligations, breach, and remedies."
        }
        Category::Rights => {
            "Focus on the user's rights as a tenant, employee, consumer, or citizen, and how those rights are enforced."
        }
        Category::Business => {
            "Focus on business formation, compliance, liability, and commercial relationships."
        }
    };
    format!("{BASE_SYSTEM_PROMPT}\n\n{focus}")
}
