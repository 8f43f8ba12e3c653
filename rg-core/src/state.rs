//! Keyed conversation/user state behind a pluggable store.
//!
//! The store is a plain key/value interface with optional TTL; the default
//! backend is an in-process map. `StateHandle` layers typed records and
//! per-key read-modify-write atomicity on top, and keeps operating from its
//! in-process fallback when the primary store fails.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rg_events::{ChatType, ConversationKey, SenderId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;
    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64>;
}

struct MemoryEntry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Default backend and the fallback cache for store outages.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|d| chrono::TimeDelta::from_std(d).ok())
            .map(|delta| Utc::now() + delta)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Expired entries are dropped on read.
        self.entries.remove_if(key, |_, entry| !entry.live(now));
        Ok(None)
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64> {
        let now = Utc::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: serde_json::json!(0),
            expires_at: Self::expiry(ttl),
        });
        let current = if entry.live(now) {
            entry.value.as_i64().unwrap_or(0)
        } else {
            entry.expires_at = Self::expiry(ttl);
            0
        };
        let next = current + by;
        entry.value = serde_json::json!(next);
        Ok(next)
    }
}

/// Per-conversation mutable record. Created lazily on first touch; mutated
/// by the reactive path and the desire engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub chat_type: ChatType,
    pub group_id: Option<String>,
    pub user_id: String,
    pub last_user_at: Option<DateTime<Utc>>,
    pub last_bot_at: Option<DateTime<Utc>>,
    pub last_proactive_at: Option<DateTime<Utc>>,
    pub msg_window_start: DateTime<Utc>,
    pub msg_count: u32,
    pub proactive_window_start: DateTime<Utc>,
    pub proactive_count: u32,
    pub daily_proactive_day: u32,
    pub daily_proactive_count: u32,
    pub last_message: String,
}

impl ConversationState {
    pub fn cold(chat_type: ChatType, group_id: Option<String>, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            chat_type,
            group_id,
            user_id,
            last_user_at: None,
            last_bot_at: None,
            last_proactive_at: None,
            msg_window_start: now,
            msg_count: 0,
            proactive_window_start: now,
            proactive_count: 0,
            daily_proactive_day: 0,
            daily_proactive_count: 0,
            last_message: String::new(),
        }
    }
}

/// Per end-user proactive-fatigue record, shared across that user's
/// conversations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserFatigueState {
    pub strikes: u32,
    pub last_proactive_at: Option<DateTime<Utc>>,
    pub last_user_reply_at: Option<DateTime<Utc>>,
    pub penalty_until: Option<DateTime<Utc>>,
}

impl UserFatigueState {
    pub fn penalty_active(&self, now: DateTime<Utc>) -> bool {
        self.penalty_until.is_some_and(|until| now < until)
    }
}

/// Typed access over the raw store with single-key transaction semantics:
/// every mutation runs under that key's lock, so concurrent read-modify-write
/// cycles cannot interleave and corrupt counters.
#[derive(Clone)]
pub struct StateHandle {
    primary: Arc<dyn StateStore>,
    fallback: Arc<MemoryStateStore>,
    key_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Option<Duration>,
}

impl StateHandle {
    pub fn new(primary: Arc<dyn StateStore>, ttl: Option<Duration>) -> Self {
        Self {
            primary,
            fallback: Arc::new(MemoryStateStore::new()),
            key_locks: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStateStore::new()), None)
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_raw(&self, key: &str) -> Option<serde_json::Value> {
        match self.primary.get(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key, error = %e, "state store read failed; using fallback");
                self.fallback.get(key).await.unwrap_or(None)
            }
        }
    }

    async fn write_raw(&self, key: &str, value: serde_json::Value) {
        if let Err(e) = self.primary.put(key, value.clone(), self.ttl).await {
            tracing::warn!(key, error = %e, "state store write failed; fallback only");
        }
        // Fallback mirror is always kept current so a store outage never
        // blocks admission.
        let _ = self.fallback.put(key, value, self.ttl).await;
    }

    pub async fn conversation(&self, key: &ConversationKey) -> Option<ConversationState> {
        let raw = self.read_raw(&conversation_state_key(key)).await?;
        match serde_json::from_value(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(conversation = %key, error = %e, "discarding undecodable conversation state");
                None
            }
        }
    }

    /// Read-modify-write one conversation's record under its key lock. The
    /// record is created cold on first touch.
    pub async fn update_conversation<F>(
        &self,
        key: &ConversationKey,
        chat_type: ChatType,
        group_id: Option<String>,
        sender: &SenderId,
        mutate: F,
    ) -> ConversationState
    where
        F: FnOnce(&mut ConversationState),
    {
        let store_key = conversation_state_key(key);
        let lock = self.lock_for(&store_key);
        let _guard = lock.lock().await;

        let mut state = match self.read_raw(&store_key).await {
            Some(raw) => serde_json::from_value(raw).unwrap_or_else(|_| {
                ConversationState::cold(chat_type, group_id.clone(), sender.to_string())
            }),
            None => ConversationState::cold(chat_type, group_id.clone(), sender.to_string()),
        };
        mutate(&mut state);
        match serde_json::to_value(&state) {
            Ok(raw) => self.write_raw(&store_key, raw).await,
            Err(e) => tracing::error!(conversation = %key, error = %e, "conversation state serialize failed"),
        }
        state
    }

    pub async fn user_fatigue(&self, user: &SenderId) -> UserFatigueState {
        match self.read_raw(&user_fatigue_key(user)).await {
            Some(raw) => serde_json::from_value(raw).unwrap_or_default(),
            None => UserFatigueState::default(),
        }
    }

    pub async fn update_user_fatigue<F>(&self, user: &SenderId, mutate: F) -> UserFatigueState
    where
        F: FnOnce(&mut UserFatigueState),
    {
        let store_key = user_fatigue_key(user);
        let lock = self.lock_for(&store_key);
        let _guard = lock.lock().await;

        let mut state: UserFatigueState = match self.read_raw(&store_key).await {
            Some(raw) => serde_json::from_value(raw).unwrap_or_default(),
            None => UserFatigueState::default(),
        };
        mutate(&mut state);
        match serde_json::to_value(&state) {
            Ok(raw) => self.write_raw(&store_key, raw).await,
            Err(e) => tracing::error!(user = %user, error = %e, "user fatigue state serialize failed"),
        }
        state
    }

    /// Conversation keys with stored state, for the desire engine's sweep.
    pub async fn known_conversations(&self) -> Vec<ConversationKey> {
        match self.read_raw(CONVERSATION_INDEX_KEY).await {
            Some(raw) => serde_json::from_value::<Vec<String>>(raw)
                .unwrap_or_default()
                .into_iter()
                .map(ConversationKey::from)
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn remember_conversation(&self, key: &ConversationKey) {
        let lock = self.lock_for(CONVERSATION_INDEX_KEY);
        let _guard = lock.lock().await;
        let mut keys: Vec<String> = match self.read_raw(CONVERSATION_INDEX_KEY).await {
            Some(raw) => serde_json::from_value(raw).unwrap_or_default(),
            None => Vec::new(),
        };
        if !keys.iter().any(|k| k == key.as_str()) {
            keys.push(key.as_str().to_string());
            match serde_json::to_value(&keys) {
                Ok(raw) => self.write_raw(CONVERSATION_INDEX_KEY, raw).await,
                Err(e) => tracing::error!(error = %e, "conversation index serialize failed"),
            }
        }
    }
}

const CONVERSATION_INDEX_KEY: &str = "replygate:conversations";

fn conversation_state_key(key: &ConversationKey) -> String {
    format!("replygate:conv:{key}")
}

fn user_fatigue_key(user: &SenderId) -> String {
    format!("replygate:user:{user}")
}
