pub const MIN_CONFIDENCE: f64 = 0.6;
pub const MAX_CONFIDENCE: f64 = 0.98;

const BASE_CONFIDENCE: f64 = 0.85;
const LONG_ANSWER_CHARS: usize = 500;
const VERY_LONG_ANSWER_CHARS: usize = 1000;
const HEDGING_PENALTY: f64 = 0.02;
const CONTEXT_PENALTY: f64 = 0.10;

const HEDGING_PHRASES: &[&str] = &["might", "may", "possibly", "uncertain", "not sure", "consult"];

/// Heuristic confidence in `[MIN_CONFIDENCE, MAX_CONFIDENCE]`.
///
/// Each hedging phrase counts once however often it appears. Length is measured in characters.
pub fn score(answer: &str, context_appropriate: bool) -> f64 {
    let length = answer.chars().count();
    let lowered = answer.to_lowercase();

    let mut delta = 0.0;
    if length > LONG_ANSWER_CHARS {
        delta += 0.05;
    }
    if length > VERY_LONG_ANSWER_CHARS {
        delta += 0.03;
    }
    let hedges = HEDGING_PHRASES
        .iter()
        .filter(|phrase| lowered.contains(*phrase))
        .count();
    delta -= HEDGING_PENALTY * hedges as f64;
    if !context_appropriate {
        delta -= CONTEXT_PENALTY;
    }

    (BASE_CONFIDENCE + delta).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}
