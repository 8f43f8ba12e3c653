//! Admission gate: decides whether an inbound message proceeds to reply
//! generation.
//!
//! Decision order for group messages: concurrency, attention window,
//! sender/group fatigue, interest scoring into the leaky-bucket accumulator,
//! then the final decision oracle. Private chats always reply. Explicit
//! mentions override fatigue and (when configured) everything after the
//! attention window.

use crate::config::PipelineConfig;
use crate::fatigue::FatigueTracker;
use crate::scheduler::{ConversationScheduler, TaskRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rg_events::{ChatType, ConversationKey, GroupKey, InboundEvent, SenderId};
use rg_oracles::{
    DecisionOracle, GateSignals, InterestScore, InterestScorer, InterestVerdict, ReplyDecision,
    call_with_timeout,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Attention window full and the sender is neither a member nor
    /// mentioned.
    AttentionFull,
    SenderFatigue,
    GroupFatigue,
    /// Interest scorer said ignore.
    ScorerIgnore,
    /// Accumulated evidence still below the gate threshold.
    Accumulating,
    /// A generation task is already active for this conversation; keep
    /// accumulating instead of piling on.
    ActiveTaskPresent,
    /// Decision oracle voted no.
    DecisionNo,
}

#[derive(Debug)]
pub enum AdmissionOutcome {
    Reply { task: TaskRecord, mandatory: bool },
    Queued,
    Rejected(RejectReason),
}

struct AccumulatorSession {
    value: f64,
    last_ts: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GateStatsSnapshot {
    pub considered: u64,
    pub replied: u64,
    pub rejected: u64,
    pub score_sum: f64,
    pub scored: u64,
}

impl GateStatsSnapshot {
    pub fn reply_ratio(&self) -> f64 {
        if self.considered == 0 {
            0.0
        } else {
            self.replied as f64 / self.considered as f64
        }
    }

    pub fn mean_score(&self) -> f64 {
        if self.scored == 0 {
            0.0
        } else {
            self.score_sum / self.scored as f64
        }
    }
}

/// Lock-free counters; the score sum carries f64 bits in an `AtomicU64`.
#[derive(Default)]
struct GateStats {
    considered: AtomicU64,
    replied: AtomicU64,
    rejected: AtomicU64,
    scored: AtomicU64,
    score_sum_bits: AtomicU64,
}

impl GateStats {
    fn considered(&self) {
        self.considered.fetch_add(1, Ordering::Relaxed);
    }

    fn scored(&self, score: f64) {
        self.scored.fetch_add(1, Ordering::Relaxed);
        let mut bits = self.score_sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(bits) + score).to_bits();
            match self.score_sum_bits.compare_exchange_weak(
                bits,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => bits = current,
            }
        }
    }

    fn replied(&self) {
        self.replied.fetch_add(1, Ordering::Relaxed);
    }

    fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GateStatsSnapshot {
        GateStatsSnapshot {
            considered: self.considered.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            score_sum: f64::from_bits(self.score_sum_bits.load(Ordering::Relaxed)),
            scored: self.scored.load(Ordering::Relaxed),
        }
    }
}

/// Bounded per-group set of senders currently eligible for replies without
/// extra scrutiny. Membership expires `window_ms` after last touch.
struct AttentionWindow {
    members: DashMap<GroupKey, Vec<(SenderId, DateTime<Utc>)>>,
    window_ms: u64,
    capacity: usize,
}

impl AttentionWindow {
    fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            members: DashMap::new(),
            window_ms,
            capacity,
        }
    }

    /// True when the sender may pass. Passing adds or refreshes membership;
    /// a mentioned sender always passes, evicting the oldest member when the
    /// window is full.
    fn touch(&self, group: &GroupKey, sender: &SenderId, mentioned: bool, now: DateTime<Utc>) -> bool {
        let window = chrono::TimeDelta::milliseconds(self.window_ms as i64);
        let mut entry = self.members.entry(group.clone()).or_default();
        entry.retain(|(_, last)| now - *last <= window);

        if let Some(member) = entry.iter_mut().find(|(id, _)| id == sender) {
            member.1 = now;
            return true;
        }
        if entry.len() < self.capacity {
            entry.push((sender.clone(), now));
            return true;
        }
        if mentioned {
            if let Some(oldest) = entry
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, last))| *last)
                .map(|(i, _)| i)
            {
                entry.remove(oldest);
            }
            entry.push((sender.clone(), now));
            return true;
        }
        false
    }
}

pub struct AdmissionGate {
    cfg: PipelineConfig,
    scheduler: Arc<ConversationScheduler>,
    sender_fatigue: FatigueTracker,
    group_fatigue: FatigueTracker,
    attention: AttentionWindow,
    accumulators: DashMap<ConversationKey, AccumulatorSession>,
    scorer: Arc<dyn InterestScorer>,
    decision: Arc<dyn DecisionOracle>,
    stats: GateStats,
}

impl AdmissionGate {
    pub fn new(
        cfg: PipelineConfig,
        scheduler: Arc<ConversationScheduler>,
        scorer: Arc<dyn InterestScorer>,
        decision: Arc<dyn DecisionOracle>,
    ) -> Self {
        let attention = AttentionWindow::new(cfg.attention.window_ms, cfg.attention.capacity);
        Self {
            cfg,
            scheduler,
            sender_fatigue: FatigueTracker::new(),
            group_fatigue: FatigueTracker::new(),
            attention,
            accumulators: DashMap::new(),
            scorer,
            decision,
            stats: GateStats::default(),
        }
    }

    pub fn stats(&self) -> GateStatsSnapshot {
        self.stats.snapshot()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %event.conversation_key()))]
    pub async fn evaluate(&self, event: &InboundEvent) -> AdmissionOutcome {
        let now = Utc::now();
        let key = event.conversation_key();
        self.stats.considered();

        // Private chats reply unconditionally; only the concurrency bound
        // still applies.
        if event.chat_type == ChatType::Private {
            return self.admit_mandatory(&key, event, now);
        }

        let Some(group) = event.group_key() else {
            tracing::warn!(conversation = %key, "group message without group id; treating as private");
            return self.admit_mandatory(&key, event, now);
        };

        if self.scheduler.active_count(&key) >= self.cfg.scheduler.max_concurrent_per_conversation
        {
            self.scheduler.enqueue(&key, event.clone());
            return AdmissionOutcome::Queued;
        }

        let mentioned = event.is_explicit_mention;
        if !self
            .attention
            .touch(&group, &event.sender_id, mentioned, now)
        {
            tracing::debug!(conversation = %key, "rejected: attention window full");
            return self.reject(RejectReason::AttentionFull);
        }

        // Proactive candidates already passed the desire engine's quota and
        // fatigue policy; they only contend for the scheduler slot.
        if event.is_proactive() {
            return self.admit(&key, &group, event, now, false);
        }

        if self.cfg.gate.mandatory_mention && mentioned {
            return self.admit(&key, &group, event, now, true);
        }

        let sender_verdict = self.sender_fatigue.check(
            event.sender_id.as_str(),
            now,
            &self.cfg.fatigue.user,
            mentioned,
        );
        if !sender_verdict.allow {
            tracing::debug!(
                conversation = %key,
                count = sender_verdict.count,
                fatigue_score = sender_verdict.fatigue_score,
                "rejected: sender fatigue backoff"
            );
            return self.reject(RejectReason::SenderFatigue);
        }
        let group_verdict =
            self.group_fatigue
                .check(group.as_str(), now, &self.cfg.fatigue.group, mentioned);
        if !group_verdict.allow {
            tracing::debug!(
                conversation = %key,
                count = group_verdict.count,
                fatigue_score = group_verdict.fatigue_score,
                "rejected: group fatigue backoff"
            );
            return self.reject(RejectReason::GroupFatigue);
        }

        if !mentioned {
            let signals = GateSignals {
                is_explicit_mention: false,
                is_name_mention: event.is_name_mention,
                sender_fatigue: sender_verdict.fatigue_score,
                group_fatigue: group_verdict.fatigue_score,
                recent_context: Vec::new(),
                policy: serde_json::Value::Null,
            };
            let score = self.score_interest(event, &signals).await;
            self.stats.scored(score.score);
            if score.verdict == InterestVerdict::Ignore {
                tracing::debug!(conversation = %key, reason = %score.reason, "rejected: scorer ignore");
                return self.reject(RejectReason::ScorerIgnore);
            }

            match self.accumulate(&key, score.score, now) {
                AccumulateOutcome::Rejected(reason) => return self.reject(reason),
                AccumulateOutcome::Crossed => {}
            }

            let decision = self.decide(event, &signals).await;
            if !decision.should_reply {
                tracing::debug!(
                    conversation = %key,
                    confidence = decision.confidence,
                    reason = %decision.reason,
                    "rejected: decision oracle voted no"
                );
                return self.reject(RejectReason::DecisionNo);
            }
        }

        self.admit(&key, &group, event, now, mentioned)
    }

    fn admit_mandatory(
        &self,
        key: &ConversationKey,
        event: &InboundEvent,
        _now: DateTime<Utc>,
    ) -> AdmissionOutcome {
        match self.scheduler.try_activate(key) {
            Some(task) => {
                self.stats.replied();
                self.reset_accumulator(key);
                tracing::info!(conversation = %key, task_id = %task.id, "admitted: mandatory reply");
                AdmissionOutcome::Reply {
                    task,
                    mandatory: true,
                }
            }
            None => {
                self.scheduler.enqueue(key, event.clone());
                AdmissionOutcome::Queued
            }
        }
    }

    fn admit(
        &self,
        key: &ConversationKey,
        group: &GroupKey,
        event: &InboundEvent,
        now: DateTime<Utc>,
        mandatory: bool,
    ) -> AdmissionOutcome {
        match self.scheduler.try_activate(key) {
            Some(task) => {
                self.sender_fatigue
                    .record(event.sender_id.as_str(), now, &self.cfg.fatigue.user);
                self.group_fatigue
                    .record(group.as_str(), now, &self.cfg.fatigue.group);
                self.reset_accumulator(key);
                self.stats.replied();
                tracing::info!(
                    conversation = %key,
                    task_id = %task.id,
                    mandatory,
                    proactive = event.is_proactive(),
                    "admitted"
                );
                AdmissionOutcome::Reply { task, mandatory }
            }
            None => {
                self.scheduler.enqueue(key, event.clone());
                AdmissionOutcome::Queued
            }
        }
    }

    fn reject(&self, reason: RejectReason) -> AdmissionOutcome {
        self.stats.rejected();
        AdmissionOutcome::Rejected(reason)
    }

    /// Leaky-bucket update: decay by elapsed half-life, add the baselined
    /// score, test the threshold. Crossing drains the bucket.
    fn accumulate(&self, key: &ConversationKey, score: f64, now: DateTime<Utc>) -> AccumulateOutcome {
        let mut session = self
            .accumulators
            .entry(key.clone())
            .or_insert(AccumulatorSession {
                value: 0.0,
                last_ts: now,
            });
        let elapsed_ms = (now - session.last_ts).num_milliseconds().max(0) as f64;
        let half_life = self.cfg.gate.half_life_ms as f64;
        session.value *= 0.5_f64.powf(elapsed_ms / half_life);
        session.value += score - self.cfg.gate.baseline;
        session.value = session.value.max(0.0);
        session.last_ts = now;

        if self.scheduler.active_count(key) > 0 {
            tracing::debug!(conversation = %key, value = session.value, "accumulating while task active");
            return AccumulateOutcome::Rejected(RejectReason::ActiveTaskPresent);
        }
        if session.value < self.cfg.gate.threshold {
            tracing::debug!(
                conversation = %key,
                value = session.value,
                threshold = self.cfg.gate.threshold,
                "accumulating more evidence before acting"
            );
            return AccumulateOutcome::Rejected(RejectReason::Accumulating);
        }
        session.value = 0.0;
        AccumulateOutcome::Crossed
    }

    /// Drains the accumulator when a task becomes active outside `evaluate`,
    /// i.e. when a queued admission is promoted on completion. Keeps the
    /// invariant that an active task always starts from an empty bucket.
    pub fn note_task_activated(&self, key: &ConversationKey) {
        self.reset_accumulator(key);
    }

    fn reset_accumulator(&self, key: &ConversationKey) {
        if let Some(mut session) = self.accumulators.get_mut(key) {
            session.value = 0.0;
            session.last_ts = Utc::now();
        }
    }

    /// Accumulator value after decay, for tests and diagnostics.
    pub fn accumulator_value(&self, key: &ConversationKey, now: DateTime<Utc>) -> f64 {
        self.accumulators
            .get(key)
            .map(|session| {
                let elapsed_ms = (now - session.last_ts).num_milliseconds().max(0) as f64;
                session.value * 0.5_f64.powf(elapsed_ms / self.cfg.gate.half_life_ms as f64)
            })
            .unwrap_or(0.0)
    }

    async fn score_interest(&self, event: &InboundEvent, signals: &GateSignals) -> InterestScore {
        let timeout = Duration::from_millis(self.cfg.oracles.call_timeout_ms);
        match call_with_timeout(timeout, self.scorer.score(event, signals)).await {
            Ok(mut score) => {
                score.score = score.score.clamp(0.0, 1.0);
                score
            }
            Err(e) => {
                tracing::warn!(error = %e, "interest scorer failed; treating as neutral consider");
                InterestScore::neutral()
            }
        }
    }

    async fn decide(&self, event: &InboundEvent, signals: &GateSignals) -> ReplyDecision {
        let timeout = Duration::from_millis(self.cfg.oracles.call_timeout_ms);
        match call_with_timeout(timeout, self.decision.decide(event, signals)).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "decision oracle failed; defaulting to no reply");
                ReplyDecision::silent()
            }
        }
    }
}

enum AccumulateOutcome {
    Crossed,
    Rejected(RejectReason),
}
