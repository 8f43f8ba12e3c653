//! Proactive ("desire") engine: periodic tick that proposes unsolicited
//! replies for idle conversations.
//!
//! Each tick walks the known conversations, applies hard gates (active
//! hours, minimum spacing, hourly/daily quotas), multiplies the soft factors
//! (idleness, post-proactive cooling, traffic, remaining quota, per-user
//! strike penalty) into a per-tick probability, and samples. Candidates are
//! synthetic inbound events routed through the ordinary admission path.

use crate::config::DesireConfig;
use crate::state::{ConversationState, StateHandle};
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::{Rng, SeedableRng};
use rg_events::{ConversationKey, GroupId, InboundEvent, MessageId, ProactiveOrigin, SenderId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ramp length after a proactive message before desire fully recovers.
const COOL_RAMP_SECS: f64 = 600.0;
/// Rolling window for the hourly quota and the traffic factor.
pub(crate) const HOUR_WINDOW_SECS: i64 = 3_600;
/// Upper clamp on the per-tick trigger probability.
const MAX_TICK_PROBABILITY: f64 = 0.9;

pub struct DesireEngine {
    cfg: DesireConfig,
    state: StateHandle,
    out: mpsc::Sender<InboundEvent>,
}

impl DesireEngine {
    pub fn new(cfg: DesireConfig, state: StateHandle, out: mpsc::Sender<InboundEvent>) -> Self {
        Self { cfg, state, out }
    }

    /// Tick loop. Runs until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.tick_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rng = rand::rngs::StdRng::from_entropy();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("desire engine stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let now = Utc::now();
            let candidates = self.collect_proactive_candidates(now, &mut rng).await;
            for event in candidates {
                if self.out.send(event).await.is_err() {
                    tracing::error!("proactive candidate receiver dropped; stopping ticks");
                    return;
                }
            }
        }
    }

    /// One tick's worth of candidates. Outside active hours this returns
    /// empty unconditionally; no probability is evaluated.
    pub async fn collect_proactive_candidates<R: Rng>(
        &self,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Vec<InboundEvent> {
        if !within_active_hours(now.hour(), self.cfg.active_hours_start, self.cfg.active_hours_end)
        {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for key in self.state.known_conversations().await {
            let Some(state) = self.state.conversation(&key).await else {
                continue;
            };

            if let Some(last) = state.last_proactive_at {
                let since = (now - last).num_seconds();
                if since < self.cfg.min_interval_secs as i64 {
                    continue;
                }
            }
            if hourly_quota_used(&state, now) >= self.cfg.hourly_cap {
                continue;
            }
            if daily_quota_used(&state, now) >= self.cfg.daily_cap {
                continue;
            }

            let user = SenderId::new(state.user_id.clone());
            let fatigue = self.state.user_fatigue(&user).await;
            let user_factor = if fatigue.penalty_active(now) {
                self.cfg.penalty_factor
            } else {
                1.0
            };

            let idle_secs = mean_idle_secs(state.last_user_at, state.last_bot_at, now, self.cfg.idle_full_secs);
            let p = self.tick_probability(
                idle_factor(idle_secs, idle_scale(self.cfg.idle_full_secs)),
                cool_factor(state.last_proactive_at, now),
                traffic_factor(window_msg_count(&state, now), self.cfg.traffic_ceiling),
                quota_factor(hourly_quota_used(&state, now), self.cfg.hourly_cap),
                user_factor,
            );
            if rng.gen_range(0.0..1.0) >= p {
                continue;
            }

            let is_first_after_user = match (state.last_proactive_at, state.last_user_at) {
                (None, _) => true,
                (Some(proactive), Some(user_at)) => proactive < user_at,
                (Some(_), None) => false,
            };
            tracing::info!(
                conversation = %key,
                probability = p,
                idle_secs,
                is_first_after_user,
                "proactive candidate emitted"
            );
            candidates.push(synthetic_event(&state, now, is_first_after_user));
        }
        candidates
    }

    /// Per-tick probability, normalized so that at factor 1.0 the hourly
    /// expectation equals the hourly cap. Assumes uniform tick spacing; the
    /// normalization is recomputed from the configured interval every call,
    /// so a config reload changes it consistently.
    fn tick_probability(
        &self,
        idle: f64,
        cool: f64,
        traffic: f64,
        quota: f64,
        user_fatigue: f64,
    ) -> f64 {
        let ticks_per_hour = 3_600.0 / self.cfg.tick_interval_secs.max(1) as f64;
        let base = self.cfg.hourly_cap as f64 / ticks_per_hour;
        (base * self.cfg.intensity * idle * cool * traffic * quota * user_fatigue)
            .clamp(0.0, MAX_TICK_PROBABILITY)
    }

    /// Bookkeeping after a proactive reply is actually queued for delivery:
    /// quota counters, spacing timestamps, and the unanswered-proactive
    /// strike ladder.
    pub async fn note_proactive_sent(&self, key: &ConversationKey, now: DateTime<Utc>) {
        let Some(snapshot) = self.state.conversation(key).await else {
            tracing::warn!(conversation = %key, "proactive sent for unknown conversation");
            return;
        };
        let user = SenderId::new(snapshot.user_id.clone());
        let chat_type = snapshot.chat_type;
        let group_id = snapshot.group_id.clone();

        self.state
            .update_conversation(key, chat_type, group_id, &user, |s| {
                if window_rolled(s.proactive_window_start, now) {
                    s.proactive_window_start = now;
                    s.proactive_count = 0;
                }
                s.proactive_count += 1;
                let day = now.ordinal();
                if s.daily_proactive_day != day {
                    s.daily_proactive_day = day;
                    s.daily_proactive_count = 0;
                }
                s.daily_proactive_count += 1;
                s.last_proactive_at = Some(now);
                s.last_bot_at = Some(now);
            })
            .await;

        let response_window = chrono::TimeDelta::seconds(self.cfg.response_window_secs as i64);
        let max_strikes = self.cfg.max_strikes;
        let penalty = chrono::TimeDelta::seconds(self.cfg.penalty_duration_secs as i64);
        self.state
            .update_user_fatigue(&user, |f| {
                let answered = match (f.last_proactive_at, f.last_user_reply_at) {
                    // First proactive message to this user; nothing to hold
                    // against them.
                    (None, _) => true,
                    (Some(prior), Some(reply)) => reply > prior && reply - prior <= response_window,
                    (Some(_), None) => false,
                };
                if answered {
                    f.strikes = 0;
                } else {
                    f.strikes += 1;
                    if f.strikes >= max_strikes {
                        f.penalty_until = Some(now + penalty);
                        tracing::info!(
                            user = %user,
                            strikes = f.strikes,
                            "proactive penalty armed after unanswered messages"
                        );
                    }
                }
                f.last_proactive_at = Some(now);
            })
            .await;
    }

    /// Called on every genuine user message so the strike ladder can tell
    /// answered proactive messages from ignored ones.
    pub async fn note_user_reply(&self, user: &SenderId, now: DateTime<Utc>) {
        self.state
            .update_user_fatigue(user, |f| {
                f.last_user_reply_at = Some(now);
            })
            .await;
    }
}

fn synthetic_event(
    state: &ConversationState,
    now: DateTime<Utc>,
    is_first_after_user: bool,
) -> InboundEvent {
    InboundEvent {
        message_id: MessageId::new(Uuid::new_v4().to_string()),
        chat_type: state.chat_type,
        group_id: state.group_id.clone().map(GroupId::new),
        sender_id: SenderId::new(state.user_id.clone()),
        sender_name: state.user_id.clone(),
        is_explicit_mention: false,
        is_name_mention: false,
        text: String::new(),
        received_at: now,
        proactive: Some(ProactiveOrigin {
            is_first_after_user,
        }),
    }
}

/// [start, end) with midnight wrap when start > end. start == end means the
/// engine is never dormant.
pub fn within_active_hours(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

fn idle_scale(idle_full_secs: u64) -> f64 {
    // Reaches ~95% of full desire at the configured "fully idle" silence.
    idle_full_secs.max(1) as f64 / 3.0
}

fn idle_factor(idle_secs: f64, scale: f64) -> f64 {
    1.0 - (-idle_secs / scale).exp()
}

fn mean_idle_secs(
    last_user_at: Option<DateTime<Utc>>,
    last_bot_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    idle_full_secs: u64,
) -> f64 {
    let since = |ts: Option<DateTime<Utc>>| {
        ts.map(|t| (now - t).num_seconds().max(0) as f64)
            .unwrap_or(idle_full_secs as f64)
    };
    (since(last_user_at) + since(last_bot_at)) / 2.0
}

/// Linear 0 -> 1 over the ten minutes after the last proactive message.
fn cool_factor(last_proactive_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match last_proactive_at {
        None => 1.0,
        Some(last) => {
            let since = (now - last).num_seconds().max(0) as f64;
            (since / COOL_RAMP_SECS).clamp(0.0, 1.0)
        }
    }
}

fn traffic_factor(window_count: u32, ceiling: u32) -> f64 {
    if window_count * 2 < ceiling {
        1.0
    } else if window_count < ceiling {
        0.5
    } else {
        0.0
    }
}

fn quota_factor(used: u32, cap: u32) -> f64 {
    if cap == 0 {
        return 0.0;
    }
    let used_ratio = (used as f64 / cap as f64).clamp(0.0, 1.0);
    (1.0 - used_ratio).powf(1.5)
}

/// True when `start` no longer anchors the current hourly window. A start
/// ahead of `now` also rolls over: cold records are stamped with wall-clock
/// time, which can sit past an injected or stepped-back `now`.
pub(crate) fn window_rolled(start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    !(0..HOUR_WINDOW_SECS).contains(&(now - start).num_seconds())
}

fn window_msg_count(state: &ConversationState, now: DateTime<Utc>) -> u32 {
    if window_rolled(state.msg_window_start, now) {
        0
    } else {
        state.msg_count
    }
}

fn hourly_quota_used(state: &ConversationState, now: DateTime<Utc>) -> u32 {
    if window_rolled(state.proactive_window_start, now) {
        0
    } else {
        state.proactive_count
    }
}

fn daily_quota_used(state: &ConversationState, now: DateTime<Utc>) -> u32 {
    if state.daily_proactive_day != now.ordinal() {
        0
    } else {
        state.daily_proactive_count
    }
}
