use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestVerdict {
    /// Not worth engaging; admission stops here.
    Ignore,
    /// Worth weighing; the score feeds the gate accumulator.
    Consider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterestScore {
    pub verdict: InterestVerdict,
    /// Normalized to [0, 1].
    pub score: f64,
    pub reason: String,
}

impl InterestScore {
    /// Conservative stand-in when the scorer fails or times out: no evidence
    /// either way, the decision oracle arbitrates.
    pub fn neutral() -> Self {
        Self {
            verdict: InterestVerdict::Consider,
            score: 0.0,
            reason: "scorer unavailable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyDecision {
    pub should_reply: bool,
    /// Normalized to [0, 1].
    pub confidence: f64,
    pub reason: String,
}

impl ReplyDecision {
    /// Conservative stand-in on oracle failure: stay quiet.
    pub fn silent() -> Self {
        Self {
            should_reply: false,
            confidence: 0.0,
            reason: "decision oracle unavailable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimilarityJudgement {
    pub are_similar: bool,
    /// Normalized to [0, 1].
    pub similarity: f64,
}

impl SimilarityJudgement {
    /// Conservative stand-in on oracle failure: never suppress a send on
    /// uncertain grounds.
    pub fn dissimilar() -> Self {
        Self {
            are_similar: false,
            similarity: 0.0,
        }
    }
}

/// Signals handed to the scorer and decision oracle alongside the message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSignals {
    pub is_explicit_mention: bool,
    pub is_name_mention: bool,
    /// Sender-granularity fatigue score in [0, 1].
    pub sender_fatigue: f64,
    /// Group-granularity fatigue score in [0, 1].
    pub group_fatigue: f64,
    /// Recent messages in this conversation, oldest first.
    pub recent_context: Vec<String>,
    /// Policy limits the oracle may weigh (free-form, serialized config).
    pub policy: serde_json::Value,
}
