//! Pipeline configuration loader.
//!
//! TOML file, env-var overrides applied after parse, then a validation pass.
//! Malformed numeric env values keep the file/default value instead of
//! failing startup.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub attention: AttentionConfig,
    #[serde(default)]
    pub fatigue: FatigueConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub desire: DesireConfig,
    #[serde(default)]
    pub burst: BurstConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub oracles: OraclesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Max simultaneously ACTIVE generation tasks per conversation.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_conversation: usize,
    /// Queued admissions older than this are dropped, never retried.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_conversation: default_max_concurrent(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttentionConfig {
    /// How long a sender stays in a group's attention window untouched.
    #[serde(default = "default_attention_window_ms")]
    pub window_ms: u64,
    /// Max senders attended per group at once.
    #[serde(default = "default_attention_capacity")]
    pub capacity: usize,
}

fn default_attention_window_ms() -> u64 {
    120_000
}

fn default_attention_capacity() -> usize {
    3
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            window_ms: default_attention_window_ms(),
            capacity: default_attention_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FatigueConfig {
    #[serde(default = "FatigueParams::user_defaults")]
    pub user: FatigueParams,
    #[serde(default = "FatigueParams::group_defaults")]
    pub group: FatigueParams,
}

/// Rolling-window backoff parameters, applied separately at sender and group
/// granularity.
#[derive(Debug, Clone, Deserialize)]
pub struct FatigueParams {
    pub window_ms: u64,
    pub base_limit: usize,
    pub min_interval_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_multiplier: f64,
}

impl FatigueParams {
    pub fn user_defaults() -> Self {
        Self {
            window_ms: 300_000,
            base_limit: 5,
            min_interval_ms: 8_000,
            backoff_factor: 1.6,
            max_backoff_multiplier: 8.0,
        }
    }

    pub fn group_defaults() -> Self {
        Self {
            window_ms: 300_000,
            base_limit: 12,
            min_interval_ms: 5_000,
            backoff_factor: 1.4,
            max_backoff_multiplier: 6.0,
        }
    }
}

impl Default for FatigueParams {
    fn default() -> Self {
        Self::user_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// Subtracted from each interest score before it accumulates.
    #[serde(default = "default_gate_baseline")]
    pub baseline: f64,
    /// Accumulated evidence needed before a non-mention group message is
    /// promoted to generation.
    #[serde(default = "default_gate_threshold")]
    pub threshold: f64,
    /// Half-life of the leaky-bucket accumulator.
    #[serde(default = "default_gate_half_life_ms")]
    pub half_life_ms: u64,
    /// When true, an explicit mention always forces a reply regardless of
    /// fatigue, scoring, and the decision oracle.
    #[serde(default = "default_mandatory_mention")]
    pub mandatory_mention: bool,
}

fn default_gate_baseline() -> f64 {
    0.3
}

fn default_gate_threshold() -> f64 {
    0.8
}

fn default_gate_half_life_ms() -> u64 {
    90_000
}

fn default_mandatory_mention() -> bool {
    true
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            baseline: default_gate_baseline(),
            threshold: default_gate_threshold(),
            half_life_ms: default_gate_half_life_ms(),
            mandatory_mention: default_mandatory_mention(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DesireConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Active hour range [start, end) in UTC; wraps past midnight when
    /// start > end.
    #[serde(default = "default_active_hours_start")]
    pub active_hours_start: u32,
    #[serde(default = "default_active_hours_end")]
    pub active_hours_end: u32,
    /// Global multiplier on the per-tick trigger probability.
    #[serde(default = "default_intensity")]
    pub intensity: f64,
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
    #[serde(default = "default_min_proactive_interval_secs")]
    pub min_interval_secs: u64,
    /// Silence (user + bot) considered "fully idle"; feeds the idle scale.
    #[serde(default = "default_idle_full_secs")]
    pub idle_full_secs: u64,
    /// Recent-message ceiling for the traffic factor, per fatigue window.
    #[serde(default = "default_traffic_ceiling")]
    pub traffic_ceiling: u32,
    /// Window in which a user reply acquits the previous proactive message.
    #[serde(default = "default_response_window_secs")]
    pub response_window_secs: u64,
    #[serde(default = "default_max_strikes")]
    pub max_strikes: u32,
    /// Probability multiplier while a user's strike penalty is armed.
    #[serde(default = "default_penalty_factor")]
    pub penalty_factor: f64,
    #[serde(default = "default_penalty_duration_secs")]
    pub penalty_duration_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_active_hours_start() -> u32 {
    9
}

fn default_active_hours_end() -> u32 {
    23
}

fn default_intensity() -> f64 {
    1.0
}

fn default_hourly_cap() -> u32 {
    2
}

fn default_daily_cap() -> u32 {
    10
}

fn default_min_proactive_interval_secs() -> u64 {
    900
}

fn default_idle_full_secs() -> u64 {
    1_800
}

fn default_traffic_ceiling() -> u32 {
    20
}

fn default_response_window_secs() -> u64 {
    1_800
}

fn default_max_strikes() -> u32 {
    3
}

fn default_penalty_factor() -> f64 {
    0.2
}

fn default_penalty_duration_secs() -> u64 {
    86_400
}

impl Default for DesireConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_interval_secs: default_tick_interval_secs(),
            active_hours_start: default_active_hours_start(),
            active_hours_end: default_active_hours_end(),
            intensity: default_intensity(),
            hourly_cap: default_hourly_cap(),
            daily_cap: default_daily_cap(),
            min_interval_secs: default_min_proactive_interval_secs(),
            idle_full_secs: default_idle_full_secs(),
            traffic_ceiling: default_traffic_ceiling(),
            response_window_secs: default_response_window_secs(),
            max_strikes: default_max_strikes(),
            penalty_factor: default_penalty_factor(),
            penalty_duration_secs: default_penalty_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BurstConfig {
    #[serde(default = "default_burst_enabled")]
    pub enabled: bool,
    #[serde(default = "default_burst_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_burst_max_users")]
    pub max_users: usize,
}

fn default_burst_enabled() -> bool {
    true
}

fn default_burst_window_ms() -> u64 {
    2_500
}

fn default_burst_max_users() -> usize {
    4
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            enabled: default_burst_enabled(),
            window_ms: default_burst_window_ms(),
            max_users: default_burst_max_users(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Collection window before a batch resolves, and pacing between sends.
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    #[serde(default = "default_recent_ttl_secs")]
    pub recent_ttl_secs: u64,
    #[serde(default = "default_recent_max_items")]
    pub recent_max_items: usize,
    /// In private chats, suppress on exact repeats only; similarity never
    /// drops a private reply.
    #[serde(default)]
    pub strict_private_mode: bool,
    /// Optional fast path: an all-text batch with at least this many
    /// same-conversation items skips similarity and keeps only the newest.
    /// Heuristic, off by default; it can suppress legitimately distinct
    /// replies.
    #[serde(default)]
    pub pure_reply_skip_threshold: Option<usize>,
    #[serde(default = "default_pure_reply_cooldown_ms")]
    pub pure_reply_skip_cooldown_ms: u64,
}

fn default_send_delay_ms() -> u64 {
    800
}

fn default_recent_ttl_secs() -> u64 {
    600
}

fn default_recent_max_items() -> usize {
    8
}

fn default_pure_reply_cooldown_ms() -> u64 {
    60_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_delay_ms: default_send_delay_ms(),
            recent_ttl_secs: default_recent_ttl_secs(),
            recent_max_items: default_recent_max_items(),
            strict_private_mode: false,
            pure_reply_skip_threshold: None,
            pure_reply_skip_cooldown_ms: default_pure_reply_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OraclesConfig {
    #[serde(default = "default_oracle_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_oracle_timeout_ms() -> u64 {
    8_000
}

impl Default for OraclesConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            let mut cfg = Self::default();
            cfg.apply_env_overrides();
            cfg.validate()?;
            return Ok(cfg);
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let mut cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        override_usize(
            "REPLYGATE_MAX_CONCURRENT",
            &mut self.scheduler.max_concurrent_per_conversation,
        );
        override_u64("REPLYGATE_QUEUE_TIMEOUT_MS", &mut self.scheduler.queue_timeout_ms);
        override_f64("REPLYGATE_GATE_THRESHOLD", &mut self.gate.threshold);
        override_f64("REPLYGATE_GATE_BASELINE", &mut self.gate.baseline);
        override_f64("REPLYGATE_DESIRE_INTENSITY", &mut self.desire.intensity);
        override_u64("REPLYGATE_SEND_DELAY_MS", &mut self.delivery.send_delay_ms);
        if let Ok(v) = std::env::var("REPLYGATE_DESIRE_ENABLED") {
            match v.trim() {
                "1" | "true" => self.desire.enabled = true,
                "0" | "false" => self.desire.enabled = false,
                other => {
                    tracing::warn!(value = %other, "ignoring malformed REPLYGATE_DESIRE_ENABLED");
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.max_concurrent_per_conversation == 0 {
            return Err(anyhow::anyhow!(
                "scheduler.max_concurrent_per_conversation must be > 0"
            ));
        }
        if self.attention.capacity == 0 {
            return Err(anyhow::anyhow!("attention.capacity must be > 0"));
        }
        if self.burst.enabled && self.burst.max_users < 2 {
            return Err(anyhow::anyhow!("burst.max_users must be >= 2 when enabled"));
        }
        if !(0.0..=1.0).contains(&self.gate.baseline) {
            return Err(anyhow::anyhow!("gate.baseline must be within [0, 1]"));
        }
        if self.gate.threshold <= 0.0 {
            return Err(anyhow::anyhow!("gate.threshold must be > 0"));
        }
        if self.gate.half_life_ms == 0 {
            return Err(anyhow::anyhow!("gate.half_life_ms must be > 0"));
        }
        if self.desire.active_hours_start > 23 || self.desire.active_hours_end > 24 {
            return Err(anyhow::anyhow!(
                "desire.active_hours must be within 0..=23 / 0..=24"
            ));
        }
        if self.desire.enabled && self.desire.tick_interval_secs == 0 {
            return Err(anyhow::anyhow!("desire.tick_interval_secs must be > 0"));
        }
        if self.desire.enabled && self.desire.hourly_cap == 0 {
            return Err(anyhow::anyhow!("desire.hourly_cap must be > 0 when enabled"));
        }
        if !(0.0..=1.0).contains(&self.desire.penalty_factor) {
            return Err(anyhow::anyhow!("desire.penalty_factor must be within [0, 1]"));
        }
        for (label, params) in [("user", &self.fatigue.user), ("group", &self.fatigue.group)] {
            if params.base_limit == 0 {
                return Err(anyhow::anyhow!("fatigue.{label}.base_limit must be > 0"));
            }
            if params.backoff_factor < 1.0 {
                return Err(anyhow::anyhow!("fatigue.{label}.backoff_factor must be >= 1"));
            }
            if params.max_backoff_multiplier < 1.0 {
                return Err(anyhow::anyhow!(
                    "fatigue.{label}.max_backoff_multiplier must be >= 1"
                ));
            }
        }
        Ok(())
    }
}

fn override_u64(var: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(var) {
        match v.trim().parse::<u64>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value = %v, "ignoring malformed numeric env override"),
        }
    }
}

fn override_usize(var: &str, slot: &mut usize) {
    if let Ok(v) = std::env::var(var) {
        match v.trim().parse::<usize>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value = %v, "ignoring malformed numeric env override"),
        }
    }
}

fn override_f64(var: &str, slot: &mut f64) {
    if let Ok(v) = std::env::var(var) {
        match v.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => *slot = parsed,
            _ => tracing::warn!(var, value = %v, "ignoring malformed numeric env override"),
        }
    }
}
