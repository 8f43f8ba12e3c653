//! Per-conversation concurrency limits with FIFO fairness.
//!
//! Each conversation key holds a set of ACTIVE generation tasks and a queue
//! of waiting admissions. Completion (or cancellation) of an active task
//! promotes the oldest non-expired waiter; starved waiters are dropped with
//! a reason, never retried. Conversations never block each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rg_events::{ConversationKey, InboundEvent};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Active,
    Done,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub conversation: ConversationKey,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum Admit {
    /// Slot available; the task is ACTIVE.
    Active(TaskRecord),
    /// At the concurrency limit; queued FIFO for this conversation.
    Queued,
}

/// A waiter promoted to ACTIVE after a completion freed its slot.
#[derive(Debug)]
pub struct Promoted {
    pub task: TaskRecord,
    pub event: InboundEvent,
    pub waited_ms: i64,
}

struct QueuedEntry {
    event: InboundEvent,
    enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct ConversationSlot {
    active: HashMap<Uuid, TaskState>,
    waiting: VecDeque<QueuedEntry>,
}

pub struct ConversationScheduler {
    slots: DashMap<ConversationKey, ConversationSlot>,
    max_concurrent: usize,
    queue_timeout_ms: u64,
}

impl ConversationScheduler {
    pub fn new(max_concurrent: usize, queue_timeout_ms: u64) -> Self {
        Self {
            slots: DashMap::new(),
            max_concurrent,
            queue_timeout_ms,
        }
    }

    pub fn active_count(&self, key: &ConversationKey) -> usize {
        self.slots.get(key).map(|s| s.active.len()).unwrap_or(0)
    }

    /// Admit a message: activate immediately when below the limit, otherwise
    /// queue it behind this conversation's earlier waiters.
    pub fn admit(&self, key: &ConversationKey, event: InboundEvent) -> Admit {
        let now = Utc::now();
        let mut slot = self.slots.entry(key.clone()).or_default();
        if slot.active.len() < self.max_concurrent {
            let task = TaskRecord {
                id: Uuid::new_v4(),
                conversation: key.clone(),
                created_at: now,
            };
            slot.active.insert(task.id, TaskState::Active);
            tracing::debug!(
                conversation = %key,
                task_id = %task.id,
                active = slot.active.len(),
                "task activated"
            );
            Admit::Active(task)
        } else {
            slot.waiting.push_back(QueuedEntry {
                event,
                enqueued_at: now,
            });
            tracing::debug!(
                conversation = %key,
                waiting = slot.waiting.len(),
                "admission queued at concurrency limit"
            );
            Admit::Queued
        }
    }

    /// Queue an admission without trying to activate it. The gate uses this
    /// when a later pipeline step has already decided the message must wait.
    pub fn enqueue(&self, key: &ConversationKey, event: InboundEvent) {
        let mut slot = self.slots.entry(key.clone()).or_default();
        slot.waiting.push_back(QueuedEntry {
            event,
            enqueued_at: Utc::now(),
        });
        tracing::debug!(
            conversation = %key,
            waiting = slot.waiting.len(),
            "admission queued"
        );
    }

    /// Activate a task without an event payload. Used when the admission
    /// decision was made elsewhere (burst-merge primaries).
    pub fn try_activate(&self, key: &ConversationKey) -> Option<TaskRecord> {
        let mut slot = self.slots.entry(key.clone()).or_default();
        if slot.active.len() >= self.max_concurrent {
            return None;
        }
        let task = TaskRecord {
            id: Uuid::new_v4(),
            conversation: key.clone(),
            created_at: Utc::now(),
        };
        slot.active.insert(task.id, TaskState::Active);
        Some(task)
    }

    /// Release a finished task's slot and promote the oldest waiter that has
    /// not starved past the queue timeout. Expired waiters are dropped with
    /// a warning and never retried.
    pub fn complete(&self, key: &ConversationKey, task_id: Uuid) -> Option<Promoted> {
        self.release(key, task_id, TaskState::Done)
    }

    /// Cancelled tasks release their slot exactly like completions, but the
    /// caller must not enqueue their output.
    pub fn cancel(&self, key: &ConversationKey, task_id: Uuid) -> Option<Promoted> {
        self.release(key, task_id, TaskState::Cancelled)
    }

    fn release(
        &self,
        key: &ConversationKey,
        task_id: Uuid,
        final_state: TaskState,
    ) -> Option<Promoted> {
        let now = Utc::now();
        let mut slot = self.slots.get_mut(key)?;
        if slot.active.remove(&task_id).is_none() {
            tracing::warn!(conversation = %key, task_id = %task_id, "release of unknown task");
            return None;
        }
        tracing::debug!(
            conversation = %key,
            task_id = %task_id,
            state = ?final_state,
            active = slot.active.len(),
            "task released"
        );

        while let Some(entry) = slot.waiting.pop_front() {
            let waited_ms = (now - entry.enqueued_at).num_milliseconds();
            if waited_ms > self.queue_timeout_ms as i64 {
                tracing::warn!(
                    conversation = %key,
                    waited_ms,
                    queue_timeout_ms = self.queue_timeout_ms,
                    reason = "queue_timeout",
                    "dropping starved queued admission"
                );
                continue;
            }
            let task = TaskRecord {
                id: Uuid::new_v4(),
                conversation: key.clone(),
                created_at: now,
            };
            slot.active.insert(task.id, TaskState::Active);
            return Some(Promoted {
                task,
                event: entry.event,
                waited_ms,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use rg_events::{ChatType, GroupId, MessageId, SenderId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn key(sender: &str) -> ConversationKey {
        event(sender, "").conversation_key()
    }

    #[test]
    fn admissions_beyond_limit_queue_fifo() {
        let scheduler = ConversationScheduler::new(1, 30_000);
        let k = key("alice");

        let first = scheduler.admit(&k, event("alice", "one"));
        let Admit::Active(task) = first else {
            panic!("first admission should activate");
        };
        assert!(matches!(
            scheduler.admit(&k, event("alice", "two")),
            Admit::Queued
        ));
        assert!(matches!(
            scheduler.admit(&k, event("alice", "three")),
            Admit::Queued
        ));
        assert_eq!(scheduler.active_count(&k), 1);

        let promoted = scheduler.complete(&k, task.id).expect("oldest promotes");
        assert_eq!(promoted.event.text, "two");
        let promoted = scheduler
            .complete(&k, promoted.task.id)
            .expect("next promotes");
        assert_eq!(promoted.event.text, "three");
        assert!(scheduler.complete(&k, promoted.task.id).is_none());
        assert_eq!(scheduler.active_count(&k), 0);
    }

    #[test]
    fn conversations_do_not_block_each_other() {
        let scheduler = ConversationScheduler::new(1, 30_000);
        let Admit::Active(_) = scheduler.admit(&key("alice"), event("alice", "hi")) else {
            panic!("alice should activate");
        };
        let Admit::Active(_) = scheduler.admit(&key("bob"), event("bob", "hi")) else {
            panic!("bob should activate despite alice's active task");
        };
    }

    #[test]
    fn starved_waiters_are_dropped_not_retried() {
        let scheduler = ConversationScheduler::new(1, 0);
        let k = key("alice");
        let Admit::Active(task) = scheduler.admit(&k, event("alice", "one")) else {
            panic!("activates");
        };
        assert!(matches!(
            scheduler.admit(&k, event("alice", "two")),
            Admit::Queued
        ));
        // Force the waiter over the (zero) timeout.
        {
            let mut slot = scheduler.slots.get_mut(&k).expect("slot exists");
            slot.waiting[0].enqueued_at = Utc::now() - TimeDelta::seconds(5);
        }
        assert!(scheduler.complete(&k, task.id).is_none());
        assert_eq!(scheduler.active_count(&k), 0);
    }

    #[test]
    fn cancel_releases_slot_and_promotes() {
        let scheduler = ConversationScheduler::new(1, 30_000);
        let k = key("alice");
        let Admit::Active(task) = scheduler.admit(&k, event("alice", "one")) else {
            panic!("activates");
        };
        assert!(matches!(
            scheduler.admit(&k, event("alice", "two")),
            Admit::Queued
        ));
        let promoted = scheduler.cancel(&k, task.id).expect("waiter promotes");
        assert_eq!(promoted.event.text, "two");
        assert_eq!(scheduler.active_count(&k), 1);
    }

    #[tokio::test]
    async fn active_count_never_exceeds_limit_under_concurrency() {
        const LIMIT: usize = 3;
        let scheduler = Arc::new(ConversationScheduler::new(LIMIT, 30_000));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let k = key("alice");

        let mut joins = Vec::new();
        for i in 0..64 {
            let scheduler = scheduler.clone();
            let max_seen = max_seen.clone();
            let k = k.clone();
            joins.push(tokio::spawn(async move {
                match scheduler.admit(&k, event("alice", &format!("m{i}"))) {
                    Admit::Active(task) => {
                        let seen = scheduler.active_count(&k);
                        max_seen.fetch_max(seen, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        let mut next = scheduler.complete(&k, task.id);
                        while let Some(promoted) = next {
                            let seen = scheduler.active_count(&k);
                            max_seen.fetch_max(seen, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            next = scheduler.complete(&k, promoted.task.id);
                        }
                    }
                    Admit::Queued => {}
                }
            }));
        }
        for j in joins {
            j.await.expect("worker completes");
        }
        assert!(
            max_seen.load(Ordering::SeqCst) <= LIMIT,
            "active tasks exceeded the concurrency limit"
        );
        assert_eq!(scheduler.active_count(&k), 0, "all slots released");
    }
}
