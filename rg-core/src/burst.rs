//! Short-window coalescing of near-simultaneous group messages.
//!
//! The first admitted message in a group opens a session and arms a window
//! timer. Further messages from new senders join the session, a repeat
//! sender replaces its own pending entry, and hitting the user cap flushes
//! early. A flush emits one generation request: a plain single
//! message, or a merged bundle whose non-primary senders' scheduler slots
//! are released without separate replies.

use crate::scheduler::TaskRecord;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rg_events::{GenerationRequest, GroupKey, InboundEvent, MergedMessage, SenderEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct BurstFlush {
    pub group: GroupKey,
    pub request: GenerationRequest,
    /// The task that carries the (possibly merged) generation.
    pub primary_task: TaskRecord,
    /// Tasks folded into the merged reply; their slots must be released
    /// without generating output.
    pub folded_tasks: Vec<TaskRecord>,
}

struct PendingEntry {
    event: InboundEvent,
    task: TaskRecord,
}

struct BurstSession {
    window_start: DateTime<Utc>,
    entries: Vec<PendingEntry>,
    /// Bumped on every flush; a timer that fires with a stale generation
    /// finds nothing to do.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

type Sessions = Arc<DashMap<GroupKey, BurstSession>>;

pub struct BurstMerger {
    sessions: Sessions,
    window: Duration,
    max_users: usize,
    out: mpsc::Sender<BurstFlush>,
}

impl BurstMerger {
    pub fn new(window_ms: u64, max_users: usize, out: mpsc::Sender<BurstFlush>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            window: Duration::from_millis(window_ms),
            max_users,
            out,
        }
    }

    /// Add an admitted message to its group's burst window. Returns the task
    /// of a replaced same-sender entry, which the caller must cancel.
    pub async fn offer(
        &self,
        group: GroupKey,
        event: InboundEvent,
        task: TaskRecord,
    ) -> Option<TaskRecord> {
        let mut replaced = None;
        let mut ready: Option<Vec<PendingEntry>> = None;

        {
            let mut session = self.sessions.entry(group.clone()).or_insert_with(|| {
                tracing::debug!(group = %group, "burst session opened");
                BurstSession {
                    window_start: Utc::now(),
                    entries: Vec::new(),
                    generation: 0,
                    timer: None,
                }
            });

            if let Some(existing) = session
                .entries
                .iter_mut()
                .find(|e| e.event.sender_id == event.sender_id)
            {
                // Last message from a sender wins; the superseded task is
                // handed back for cancellation.
                replaced = Some(std::mem::replace(existing, PendingEntry { event, task }).task);
            } else {
                if session.entries.is_empty() {
                    session.window_start = Utc::now();
                }
                session.entries.push(PendingEntry { event, task });
            }

            if session.entries.len() >= self.max_users {
                if let Some(timer) = session.timer.take() {
                    timer.abort();
                }
                // Invalidate any timer that already fired but has not run.
                session.generation += 1;
                tracing::debug!(
                    group = %group,
                    window_ms = (Utc::now() - session.window_start).num_milliseconds(),
                    "burst window closed at capacity"
                );
                ready = Some(std::mem::take(&mut session.entries));
            } else if session.timer.is_none() {
                let sessions = self.sessions.clone();
                let out = self.out.clone();
                let group = group.clone();
                let generation = session.generation;
                let window = self.window;
                session.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    flush_expired(&sessions, &out, &group, generation).await;
                }));
            }
        }

        if let Some(entries) = ready {
            send_flush(&self.out, group, entries).await;
        }
        replaced
    }
}

async fn flush_expired(
    sessions: &Sessions,
    out: &mpsc::Sender<BurstFlush>,
    group: &GroupKey,
    generation: u64,
) {
    let entries = match sessions.get_mut(group) {
        Some(mut session) if session.generation == generation => {
            session.timer = None;
            session.generation += 1;
            std::mem::take(&mut session.entries)
        }
        // A capacity flush already consumed this window.
        _ => return,
    };
    if entries.is_empty() {
        return;
    }
    send_flush(out, group.clone(), entries).await;
}

async fn send_flush(out: &mpsc::Sender<BurstFlush>, group: GroupKey, mut entries: Vec<PendingEntry>) {
    let flush = if entries.len() == 1 {
        let Some(entry) = entries.pop() else { return };
        BurstFlush {
            group: group.clone(),
            request: GenerationRequest::Single(entry.event),
            primary_task: entry.task,
            folded_tasks: Vec::new(),
        }
    } else {
        let mut drained = entries.drain(..);
        let Some(primary) = drained.next() else { return };
        let Some(group_id) = primary.event.group_id.clone() else {
            tracing::warn!(group = %group, "burst entry without a group id; dropping flush");
            return;
        };
        let mut sender_entries = vec![sender_entry(&primary.event)];
        let mut folded_tasks = Vec::new();
        for entry in drained {
            sender_entries.push(sender_entry(&entry.event));
            folded_tasks.push(entry.task);
        }
        BurstFlush {
            group: group.clone(),
            request: GenerationRequest::Merged(MergedMessage {
                group_id,
                entries: sender_entries,
                merged_at: Utc::now(),
            }),
            primary_task: primary.task,
            folded_tasks,
        }
    };

    tracing::info!(
        group = %group,
        merged = matches!(flush.request, GenerationRequest::Merged(_)),
        folded = flush.folded_tasks.len(),
        "burst session flushed"
    );
    if let Err(e) = out.send(flush).await {
        tracing::error!(group = %group, error = %e, "burst flush receiver dropped");
    }
}

fn sender_entry(event: &InboundEvent) -> SenderEntry {
    SenderEntry {
        sender_id: event.sender_id.clone(),
        sender_name: event.sender_name.clone(),
        text: event.text.clone(),
        sent_at: event.received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_events::{ChatType, ConversationKey, GroupId, MessageId, SenderId};
    use uuid::Uuid;

    fn event(sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            message_id: MessageId::new(Uuid::new_v4().to_string()),
            chat_type: ChatType::Group,
            group_id: Some(GroupId::new("g1")),
            sender_id: SenderId::new(sender),
            sender_name: sender.to_string(),
            is_explicit_mention: false,
            is_name_mention: false,
            text: text.to_string(),
            received_at: Utc::now(),
            proactive: None,
        }
    }

    fn task(sender: &str) -> TaskRecord {
        TaskRecord {
            id: Uuid::new_v4(),
            conversation: ConversationKey::derive(
                ChatType::Group,
                Some(&GroupId::new("g1")),
                &SenderId::new(sender),
            ),
            created_at: Utc::now(),
        }
    }

    fn group() -> GroupKey {
        GroupKey::derive(&GroupId::new("g1"))
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_senders_within_window_merge_in_arrival_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let merger = BurstMerger::new(2_000, 5, tx);

        for sender in ["a", "b", "c"] {
            let replaced = merger
                .offer(group(), event(sender, &format!("hi from {sender}")), task(sender))
                .await;
            assert!(replaced.is_none());
        }

        tokio::time::advance(Duration::from_millis(2_100)).await;
        let flush = rx.recv().await.expect("window timer flushes");
        let GenerationRequest::Merged(merged) = flush.request else {
            panic!("three senders must merge");
        };
        let order: Vec<_> = merged.entries.iter().map(|e| e.sender_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(flush.folded_tasks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn same_sender_replaces_pending_entry() {
        let (tx, mut rx) = mpsc::channel(4);
        let merger = BurstMerger::new(2_000, 5, tx);

        let first_task = task("a");
        let first_id = first_task.id;
        assert!(merger.offer(group(), event("a", "first"), first_task).await.is_none());
        let replaced = merger
            .offer(group(), event("a", "second thoughts"), task("a"))
            .await
            .expect("second message from the same sender replaces the first");
        assert_eq!(replaced.id, first_id);

        tokio::time::advance(Duration::from_millis(2_100)).await;
        let flush = rx.recv().await.expect("flush");
        let GenerationRequest::Single(event) = flush.request else {
            panic!("one sender flushes as a single message");
        };
        assert_eq!(event.text, "second thoughts");
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_max_users_flushes_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let merger = BurstMerger::new(60_000, 2, tx);

        merger.offer(group(), event("a", "one"), task("a")).await;
        merger.offer(group(), event("b", "two"), task("b")).await;

        // No timer advance needed; capacity forced the flush.
        let flush = rx.recv().await.expect("capacity flush");
        let GenerationRequest::Merged(merged) = flush.request else {
            panic!("two senders must merge");
        };
        assert_eq!(merged.entries.len(), 2);

        // The timer firing later must not produce a second flush.
        tokio::time::advance(Duration::from_millis(61_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn single_entry_window_flushes_as_single() {
        let (tx, mut rx) = mpsc::channel(4);
        let merger = BurstMerger::new(1_000, 4, tx);
        merger.offer(group(), event("a", "solo"), task("a")).await;

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let flush = rx.recv().await.expect("flush");
        assert!(matches!(flush.request, GenerationRequest::Single(_)));
        assert!(flush.folded_tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_reopens_after_a_flush() {
        let (tx, mut rx) = mpsc::channel(4);
        let merger = BurstMerger::new(1_000, 4, tx);

        merger.offer(group(), event("a", "round one"), task("a")).await;
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(rx.recv().await.is_some());

        merger.offer(group(), event("b", "round two"), task("b")).await;
        tokio::time::advance(Duration::from_millis(1_100)).await;
        let flush = rx.recv().await.expect("second window flushes independently");
        let GenerationRequest::Single(event) = flush.request else {
            panic!("single entry");
        };
        assert_eq!(event.text, "round two");
    }
}
