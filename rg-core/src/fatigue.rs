//! Rolling-window overuse signal with exponential backoff.
//!
//! Pure evaluation over a pruned event-timestamp window, applied separately
//! at sender and group granularity. A denial from either granularity blocks
//! admission unless the message is an explicit mention.

use crate::config::FatigueParams;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct FatigueVerdict {
    pub allow: bool,
    /// Events remaining in the window after pruning.
    pub count: usize,
    /// Normalized pressure in [0, 1].
    pub fatigue_score: f64,
    pub age_of_last_event_secs: f64,
}

/// Evaluates one key's window. `events` may contain timestamps outside the
/// window; they are ignored. `important` (explicit mention) turns a denial
/// into an allow without changing the reported score.
pub fn evaluate_fatigue(
    events: &[DateTime<Utc>],
    now: DateTime<Utc>,
    params: &FatigueParams,
    important: bool,
) -> FatigueVerdict {
    let window = chrono::TimeDelta::milliseconds(params.window_ms as i64);
    let mut count = 0usize;
    let mut last: Option<DateTime<Utc>> = None;
    for &ts in events {
        if ts <= now && now - ts <= window {
            count += 1;
            if last.is_none_or(|prev| ts > prev) {
                last = Some(ts);
            }
        }
    }

    let age_of_last_event_secs = last
        .map(|ts| (now - ts).num_milliseconds().max(0) as f64 / 1_000.0)
        .unwrap_or(f64::INFINITY);

    if count <= params.base_limit {
        return FatigueVerdict {
            allow: true,
            count,
            fatigue_score: (count as f64 / params.base_limit as f64 / 2.0).clamp(0.0, 1.0),
            age_of_last_event_secs,
        };
    }

    let over = (count - params.base_limit) as f64;
    let multiplier = params
        .backoff_factor
        .powf(over)
        .min(params.max_backoff_multiplier);
    let required_ms = params.min_interval_ms as f64 * multiplier;
    let elapsed_ms = age_of_last_event_secs * 1_000.0;
    let within_backoff = elapsed_ms < required_ms;

    let fatigue_score = (0.5 + over / params.base_limit as f64 / 2.0).clamp(0.0, 1.0);

    FatigueVerdict {
        allow: !within_backoff || important,
        count,
        fatigue_score,
        age_of_last_event_secs,
    }
}

/// Per-key rolling event windows for reply fatigue. One tracker instance per
/// granularity (sender, group).
#[derive(Default)]
pub struct FatigueTracker {
    windows: DashMap<String, Vec<DateTime<Utc>>>,
}

impl FatigueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, now: DateTime<Utc>, params: &FatigueParams) {
        let mut window = self.windows.entry(key.to_string()).or_default();
        window.push(now);
        prune(&mut window, now, params.window_ms);
    }

    pub fn check(
        &self,
        key: &str,
        now: DateTime<Utc>,
        params: &FatigueParams,
        important: bool,
    ) -> FatigueVerdict {
        match self.windows.get_mut(key).as_deref_mut() {
            Some(window) => {
                prune(window, now, params.window_ms);
                evaluate_fatigue(window, now, params, important)
            }
            None => evaluate_fatigue(&[], now, params, important),
        }
    }

    /// Window size after pruning.
    pub fn count(&self, key: &str, now: DateTime<Utc>, params: &FatigueParams) -> usize {
        match self.windows.get_mut(key).as_deref_mut() {
            Some(window) => {
                prune(window, now, params.window_ms);
                window.len()
            }
            None => 0,
        }
    }
}

fn prune(window: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>, window_ms: u64) {
    let span = chrono::TimeDelta::milliseconds(window_ms as i64);
    window.retain(|&ts| ts <= now && now - ts <= span);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn params() -> FatigueParams {
        FatigueParams {
            window_ms: 60_000,
            base_limit: 3,
            min_interval_ms: 10_000,
            backoff_factor: 2.0,
            max_backoff_multiplier: 8.0,
        }
    }

    fn spaced(now: DateTime<Utc>, count: usize, gap_secs: i64) -> Vec<DateTime<Utc>> {
        (0..count)
            .map(|i| now - TimeDelta::seconds(gap_secs * (count - i) as i64))
            .collect()
    }

    #[test]
    fn under_base_limit_always_allows() {
        let now = Utc::now();
        let verdict = evaluate_fatigue(&spaced(now, 2, 5), now, &params(), false);
        assert!(verdict.allow);
        assert_eq!(verdict.count, 2);
        // count/base_limit/2 = 2/3/2
        assert!((verdict.fatigue_score - 2.0 / 3.0 / 2.0).abs() < 1e-9);
    }

    #[test]
    fn over_limit_requires_backoff_spacing() {
        let now = Utc::now();
        // 5 events, last one 2s ago. over = 2, multiplier = min(2^2, 8) = 4,
        // required spacing = 40s > 2s elapsed.
        let events = spaced(now, 5, 2);
        let verdict = evaluate_fatigue(&events, now, &params(), false);
        assert!(!verdict.allow);
        assert!(verdict.fatigue_score > 0.5);
    }

    #[test]
    fn over_limit_allows_once_spacing_elapsed() {
        let now = Utc::now();
        // 4 events, last one 21s ago. over = 1, multiplier = 2, required
        // spacing = 20s < 21s elapsed.
        let events: Vec<_> = (0..4)
            .map(|i| now - TimeDelta::seconds(21 + i * 5))
            .collect();
        let verdict = evaluate_fatigue(&events, now, &params(), false);
        assert_eq!(verdict.count, 4);
        assert!(verdict.allow);
    }

    #[test]
    fn explicit_mention_overrides_denial() {
        let now = Utc::now();
        let events = spaced(now, 5, 2);
        let denied = evaluate_fatigue(&events, now, &params(), false);
        let allowed = evaluate_fatigue(&events, now, &params(), true);
        assert!(!denied.allow);
        assert!(allowed.allow, "mention must pass regardless of backoff");
        assert_eq!(denied.count, allowed.count);
    }

    #[test]
    fn backoff_multiplier_is_clamped() {
        let mut p = params();
        p.window_ms = 600_000;
        let now = Utc::now();
        // over = 7 -> 2^7 = 128, clamped to 8 -> required spacing 80s.
        let recent = spaced(now, 10, 3);
        assert!(!evaluate_fatigue(&recent, now, &p, false).allow);
        // Same count with the last event 81s ago passes only because of the
        // clamp (unclamped spacing would be 1280s).
        let old: Vec<_> = (0..10)
            .map(|i| now - TimeDelta::seconds(81 + i * 3))
            .collect();
        let verdict = evaluate_fatigue(&old, now, &p, false);
        assert_eq!(verdict.count, 10);
        assert!(verdict.allow);
    }

    #[test]
    fn events_outside_window_are_pruned() {
        let now = Utc::now();
        let events = vec![now - TimeDelta::seconds(120), now - TimeDelta::seconds(5)];
        let verdict = evaluate_fatigue(&events, now, &params(), false);
        assert_eq!(verdict.count, 1);
    }

    #[test]
    fn tracker_accumulates_and_prunes() {
        let tracker = FatigueTracker::new();
        let p = params();
        let now = Utc::now();
        for i in 0..4 {
            tracker.record("k", now - TimeDelta::seconds(40 - i * 10), &p);
        }
        assert_eq!(tracker.count("k", now, &p), 4);
        // 45s later only the newest event (now - 10s, age 55s) fits the 60s window.
        let later = now + TimeDelta::seconds(45);
        assert_eq!(tracker.count("k", later, &p), 1);
    }
}
