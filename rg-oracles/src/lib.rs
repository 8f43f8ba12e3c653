//! Decision oracles consumed by the replygate core.
//!
//! Three narrow black-box interfaces: an interest scorer, a should-reply
//! decision oracle, and a text-similarity judge. All calls are bounded by a
//! timeout; failures degrade to conservative defaults at the call site,
//! never to an automatic reply.

mod error;
mod traits;
mod types;

pub use error::{OracleError, Result};
pub use traits::{DecisionOracle, InterestScorer, SimilarityOracle, call_with_timeout};
pub use types::{GateSignals, InterestScore, InterestVerdict, ReplyDecision, SimilarityJudgement};
