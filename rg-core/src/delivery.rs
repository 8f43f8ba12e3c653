//! Final-stage delivery: global FIFO draining, per-conversation batching,
//! near-duplicate removal, pacing, and cross-turn repeat suppression.
//!
//! The drain loop pops the head item, waits one collection window, pulls
//! every queued item for the same conversation into a batch, resolves
//! duplicates pairwise (exact resource sets plus the similarity oracle),
//! then sends the survivors in arrival order with pacing between sends.
//! Each send is checked against a small per-conversation ring of recently
//! sent content before it goes out.

use crate::config::DeliveryConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rg_events::{ConversationKey, DeliverySink, GeneratedReply};
use rg_oracles::{call_with_timeout, SimilarityJudgement, SimilarityOracle};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SendQueueItem {
    pub task_id: Uuid,
    pub conversation: ConversationKey,
    pub text: String,
    /// Normalized: trimmed, empties dropped, deduped, sorted. Equality on
    /// this field means "same resources" for dedup purposes.
    pub resource_keys: Vec<String>,
    /// The user text this reply answers; empty for proactive replies.
    pub source_question: String,
    pub has_tool_side_effect: bool,
    /// Unsolicited reply; carried through to the delivery receipt so quota
    /// bookkeeping happens only for messages that actually went out.
    pub proactive: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl SendQueueItem {
    pub fn from_reply(
        task_id: Uuid,
        conversation: ConversationKey,
        reply: &GeneratedReply,
        source_question: impl Into<String>,
        proactive: bool,
    ) -> Self {
        Self {
            task_id,
            conversation,
            text: reply.text.clone(),
            resource_keys: normalize_resources(&reply.resource_refs),
            source_question: source_question.into(),
            has_tool_side_effect: reply.has_tool_side_effect,
            proactive,
            enqueued_at: Utc::now(),
        }
    }
}

/// Emitted after the sink accepted a reply. Suppressed and failed sends
/// produce no receipt.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub task_id: Uuid,
    pub conversation: ConversationKey,
    pub proactive: bool,
    pub sent_at: DateTime<Utc>,
}

fn normalize_resources(refs: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = refs
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

struct RecentSentRecord {
    text: String,
    resource_keys: Vec<String>,
    source_question: String,
    sent_at: DateTime<Utc>,
}

pub struct DeliveryQueue {
    cfg: DeliveryConfig,
    oracle_timeout: Duration,
    similarity: Arc<dyn SimilarityOracle>,
    sink: Arc<dyn DeliverySink>,
    receipts: mpsc::Sender<DeliveryReceipt>,
    recent: DashMap<ConversationKey, VecDeque<RecentSentRecord>>,
    pure_reply_cooldowns: DashMap<ConversationKey, DateTime<Utc>>,
}

impl DeliveryQueue {
    pub fn new(
        cfg: DeliveryConfig,
        oracle_timeout_ms: u64,
        similarity: Arc<dyn SimilarityOracle>,
        sink: Arc<dyn DeliverySink>,
        receipts: mpsc::Sender<DeliveryReceipt>,
    ) -> Self {
        Self {
            cfg,
            oracle_timeout: Duration::from_millis(oracle_timeout_ms),
            similarity,
            sink,
            receipts,
            recent: DashMap::new(),
            pure_reply_cooldowns: DashMap::new(),
        }
    }

    /// Drain loop. Runs until the token is cancelled or the sender side of
    /// the queue is dropped.
    pub async fn run(&self, mut rx: mpsc::Receiver<SendQueueItem>, shutdown: CancellationToken) {
        let delay = Duration::from_millis(self.cfg.send_delay_ms);
        // Items pulled off the channel that belong to a different
        // conversation than the batch under assembly.
        let mut buffer: VecDeque<SendQueueItem> = VecDeque::new();
        loop {
            let head = match buffer.pop_front() {
                Some(item) => item,
                None => tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("delivery queue stopped");
                        return;
                    }
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => {
                            tracing::info!("delivery queue input closed");
                            return;
                        }
                    },
                },
            };

            // Collection window: let near-simultaneous outputs for the same
            // conversation pile up before dedup.
            tokio::time::sleep(delay).await;
            while let Ok(item) = rx.try_recv() {
                buffer.push_back(item);
            }

            let key = head.conversation.clone();
            let mut batch = vec![head];
            let mut rest = VecDeque::with_capacity(buffer.len());
            for item in buffer.drain(..) {
                if item.conversation == key {
                    batch.push(item);
                } else {
                    rest.push_back(item);
                }
            }
            buffer = rest;

            let batch = self.dedup_batch(batch).await;
            let mut sent_any = false;
            for item in batch {
                if sent_any {
                    tokio::time::sleep(delay).await;
                }
                sent_any |= self.send_item(item).await;
            }
        }
    }

    /// Pairwise duplicate resolution within one conversation's batch.
    /// Survivors keep their arrival order.
    async fn dedup_batch(&self, batch: Vec<SendQueueItem>) -> Vec<SendQueueItem> {
        if batch.len() < 2 {
            return batch;
        }
        if let Some(kept) = self.pure_reply_fast_path(&batch) {
            return kept;
        }

        let mut dropped = vec![false; batch.len()];
        for i in 0..batch.len() {
            if dropped[i] {
                continue;
            }
            for j in (i + 1)..batch.len() {
                if dropped[i] || dropped[j] {
                    continue;
                }
                if batch[i].resource_keys != batch[j].resource_keys {
                    continue;
                }
                let (a, b) = (&batch[i], &batch[j]);
                if a.text.is_empty() && b.text.is_empty() {
                    // Pure-resource duplicate.
                    dropped[i] = true;
                    tracing::info!(
                        conversation = %a.conversation,
                        task_id = %a.task_id,
                        reason = "resource_duplicate",
                        "dropping queued reply"
                    );
                    continue;
                }
                if a.text.is_empty() || b.text.is_empty() {
                    continue;
                }
                let replies = self.judge(&a.text, &b.text).await;
                if !replies.are_similar {
                    continue;
                }
                let questions = self.judge(&a.source_question, &b.source_question).await;
                if questions.are_similar {
                    // Repeated answer to a repeated question; legitimate.
                    continue;
                }
                dropped[i] = true;
                tracing::info!(
                    conversation = %a.conversation,
                    task_id = %a.task_id,
                    similarity = replies.similarity,
                    reason = "cross_topic_repetition",
                    "dropping queued reply"
                );
            }
        }

        batch
            .into_iter()
            .zip(dropped)
            .filter_map(|(item, drop)| (!drop).then_some(item))
            .collect()
    }

    /// Optional shortcut for large all-text batches: keep only the newest
    /// item and skip similarity calls entirely, at most once per cooldown.
    /// Heuristic, off by default; it can suppress genuinely distinct replies.
    fn pure_reply_fast_path(&self, batch: &[SendQueueItem]) -> Option<Vec<SendQueueItem>> {
        let threshold = self.cfg.pure_reply_skip_threshold?;
        if batch.len() < threshold || batch.iter().any(|i| i.has_tool_side_effect) {
            return None;
        }
        let key = &batch[0].conversation;
        let now = Utc::now();
        let cooldown = chrono::TimeDelta::milliseconds(self.cfg.pure_reply_skip_cooldown_ms as i64);
        if let Some(armed_at) = self.pure_reply_cooldowns.get(key) {
            if now - *armed_at < cooldown {
                return None;
            }
        }
        self.pure_reply_cooldowns.insert(key.clone(), now);
        let newest = batch
            .iter()
            .max_by_key(|i| i.enqueued_at)
            .cloned()
            .unwrap_or_else(|| batch[batch.len() - 1].clone());
        tracing::info!(
            conversation = %key,
            dropped = batch.len() - 1,
            reason = "pure_reply_fast_path",
            "keeping only the newest reply of a text-only batch"
        );
        Some(vec![newest])
    }

    /// Sends one item unless the recent-sent ring suppresses it. Returns
    /// whether a send actually happened (pacing only applies between real
    /// sends).
    async fn send_item(&self, item: SendQueueItem) -> bool {
        if self.suppressed_by_recent(&item).await {
            tracing::info!(
                conversation = %item.conversation,
                task_id = %item.task_id,
                reason = "recently_sent",
                "suppressing repeat delivery"
            );
            return false;
        }
        match self
            .sink
            .deliver(&item.conversation, &item.text, &item.resource_keys)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    conversation = %item.conversation,
                    task_id = %item.task_id,
                    resources = item.resource_keys.len(),
                    "reply delivered"
                );
                let receipt = DeliveryReceipt {
                    task_id: item.task_id,
                    conversation: item.conversation.clone(),
                    proactive: item.proactive,
                    sent_at: Utc::now(),
                };
                if self.receipts.send(receipt).await.is_err() {
                    tracing::debug!("delivery receipt receiver dropped");
                }
                self.record_recent(item);
                true
            }
            Err(e) => {
                tracing::error!(
                    conversation = %item.conversation,
                    task_id = %item.task_id,
                    error = %e,
                    "delivery failed"
                );
                false
            }
        }
    }

    async fn suppressed_by_recent(&self, item: &SendQueueItem) -> bool {
        let now = Utc::now();
        // Snapshot under the entry lock; oracle calls happen outside it.
        // Similarity only ever compares records carrying the same resource
        // set, mirroring the pairwise batch dedup.
        let candidates: Vec<(String, String)> = {
            let Some(mut ring) = self.recent.get_mut(&item.conversation) else {
                return false;
            };
            prune_ring(&mut ring, now, self.cfg.recent_ttl_secs, self.cfg.recent_max_items);
            for rec in ring.iter() {
                if rec.text == item.text && rec.resource_keys == item.resource_keys {
                    return true;
                }
            }
            if self.exact_match_only(&item.conversation) || item.text.is_empty() {
                return false;
            }
            ring.iter()
                .filter(|rec| !rec.text.is_empty() && rec.resource_keys == item.resource_keys)
                .map(|rec| (rec.text.clone(), rec.source_question.clone()))
                .collect()
        };

        for (text, question) in candidates {
            let replies = self.judge(&item.text, &text).await;
            if !replies.are_similar {
                continue;
            }
            let questions = self.judge(&item.source_question, &question).await;
            if !questions.are_similar {
                return true;
            }
        }
        false
    }

    /// Private conversations can be pinned to exact-match suppression so a
    /// chatty similarity oracle never eats distinct one-on-one replies.
    fn exact_match_only(&self, key: &ConversationKey) -> bool {
        self.cfg.strict_private_mode && key.as_str().starts_with("private:")
    }

    fn record_recent(&self, item: SendQueueItem) {
        let now = Utc::now();
        let mut ring = self.recent.entry(item.conversation.clone()).or_default();
        ring.push_back(RecentSentRecord {
            text: item.text,
            resource_keys: item.resource_keys,
            source_question: item.source_question,
            sent_at: now,
        });
        prune_ring(&mut ring, now, self.cfg.recent_ttl_secs, self.cfg.recent_max_items);
    }

    async fn judge(&self, a: &str, b: &str) -> SimilarityJudgement {
        match call_with_timeout(self.oracle_timeout, self.similarity.similar(a, b)).await {
            Ok(judgement) => judgement,
            Err(e) => {
                tracing::warn!(error = %e, "similarity oracle failed; treating as dissimilar");
                SimilarityJudgement::dissimilar()
            }
        }
    }
}

fn prune_ring(
    ring: &mut VecDeque<RecentSentRecord>,
    now: DateTime<Utc>,
    ttl_secs: u64,
    max_items: usize,
) {
    let ttl = chrono::TimeDelta::seconds(ttl_secs as i64);
    ring.retain(|rec| now - rec.sent_at < ttl);
    while ring.len() > max_items {
        ring.pop_front();
    }
}
