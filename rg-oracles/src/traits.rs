use crate::error::{OracleError, Result};
use crate::types::{GateSignals, InterestScore, ReplyDecision, SimilarityJudgement};
use async_trait::async_trait;
use rg_events::InboundEvent;
use std::future::Future;
use std::time::Duration;

/// Scores how interesting a non-mention group message is. Black box; the
/// gate only consumes the normalized score and verdict.
#[async_trait]
pub trait InterestScorer: Send + Sync {
    async fn score(&self, event: &InboundEvent, signals: &GateSignals) -> Result<InterestScore>;
}

/// Final should-we-reply arbiter for group messages that clear every earlier
/// admission step.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, event: &InboundEvent, signals: &GateSignals) -> Result<ReplyDecision>;
}

/// Semantic similarity judge used by the delivery queue's dedup pass.
#[async_trait]
pub trait SimilarityOracle: Send + Sync {
    async fn similar(&self, text_a: &str, text_b: &str) -> Result<SimilarityJudgement>;
}

/// Bounds an oracle call. Every oracle call in the pipeline goes through
/// this; expiry surfaces as [`OracleError::Timeout`] so the call site can
/// substitute its conservative default.
pub async fn call_with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(timeout.as_millis() as u64)),
    }
}
