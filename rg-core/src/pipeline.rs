//! Pipeline wiring: admission, burst merging, generation, delivery.
//!
//! `handle_inbound` is the single entry point for both user messages and
//! synthetic proactive candidates. Admitted messages either join their
//! group's burst window or go straight to a spawned generation task; the
//! generated reply is enqueued for delivery and the scheduler slot is
//! released, promoting the conversation's oldest waiter.

use crate::burst::{BurstFlush, BurstMerger};
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryQueue, DeliveryReceipt, SendQueueItem};
use crate::desire::{DesireEngine, window_rolled};
use crate::gate::{AdmissionGate, AdmissionOutcome, GateStatsSnapshot};
use crate::scheduler::{ConversationScheduler, TaskRecord};
use crate::state::StateHandle;
use chrono::Utc;
use rg_events::{
    ConversationKey, DeliverySink, GenerationRequest, InboundEvent, ReplyGenerator, SenderId,
};
use rg_oracles::{DecisionOracle, InterestScorer, SimilarityOracle};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

pub struct ReplyPipeline {
    cfg: PipelineConfig,
    state: StateHandle,
    gate: AdmissionGate,
    scheduler: Arc<ConversationScheduler>,
    burst: Arc<BurstMerger>,
    desire: DesireEngine,
    delivery: DeliveryQueue,
    generator: Arc<dyn ReplyGenerator>,
    delivery_tx: mpsc::Sender<SendQueueItem>,
    // Receivers are handed to the worker loops on the first `run`.
    burst_rx: Mutex<Option<mpsc::Receiver<BurstFlush>>>,
    delivery_rx: Mutex<Option<mpsc::Receiver<SendQueueItem>>>,
    proactive_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    receipt_rx: Mutex<Option<mpsc::Receiver<DeliveryReceipt>>>,
}

impl ReplyPipeline {
    pub fn new(
        cfg: PipelineConfig,
        state: StateHandle,
        scorer: Arc<dyn InterestScorer>,
        decision: Arc<dyn DecisionOracle>,
        similarity: Arc<dyn SimilarityOracle>,
        generator: Arc<dyn ReplyGenerator>,
        sink: Arc<dyn DeliverySink>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(ConversationScheduler::new(
            cfg.scheduler.max_concurrent_per_conversation,
            cfg.scheduler.queue_timeout_ms,
        ));
        let gate = AdmissionGate::new(cfg.clone(), scheduler.clone(), scorer, decision);
        let (burst_tx, burst_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let burst = Arc::new(BurstMerger::new(
            cfg.burst.window_ms,
            cfg.burst.max_users,
            burst_tx,
        ));
        let (delivery_tx, delivery_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (receipt_tx, receipt_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let delivery = DeliveryQueue::new(
            cfg.delivery.clone(),
            cfg.oracles.call_timeout_ms,
            similarity,
            sink,
            receipt_tx,
        );
        let (proactive_tx, proactive_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let desire = DesireEngine::new(cfg.desire.clone(), state.clone(), proactive_tx);

        Arc::new(Self {
            cfg,
            state,
            gate,
            scheduler,
            burst,
            desire,
            delivery,
            generator,
            delivery_tx,
            burst_rx: Mutex::new(Some(burst_rx)),
            delivery_rx: Mutex::new(Some(delivery_rx)),
            proactive_rx: Mutex::new(Some(proactive_rx)),
            receipt_rx: Mutex::new(Some(receipt_rx)),
        })
    }

    pub fn gate_stats(&self) -> GateStatsSnapshot {
        self.gate.stats()
    }

    /// Spawns the worker loops (delivery drain, burst flush consumer,
    /// proactive candidate consumer, desire ticker) and waits for shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let delivery_rx = self
            .delivery_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("pipeline is already running"))?;
        let burst_rx = self
            .burst_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("pipeline is already running"))?;
        let proactive_rx = self
            .proactive_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("pipeline is already running"))?;
        let receipt_rx = self
            .receipt_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("pipeline is already running"))?;

        let pipeline = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            pipeline.delivery.run(delivery_rx, token).await;
        });

        let pipeline = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            pipeline.burst_loop(burst_rx, token).await;
        });

        let pipeline = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            pipeline.proactive_loop(proactive_rx, token).await;
        });

        let pipeline = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            pipeline.receipt_loop(receipt_rx, token).await;
        });

        if self.cfg.desire.enabled {
            let pipeline = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                pipeline.desire.run(token).await;
            });
        }

        tracing::info!(
            desire_enabled = self.cfg.desire.enabled,
            burst_enabled = self.cfg.burst.enabled,
            "pipeline started"
        );
        shutdown.cancelled().await;
        tracing::info!("pipeline shutting down");
        Ok(())
    }

    /// Entry point for every message, reactive and proactive alike.
    pub async fn handle_inbound(self: Arc<Self>, event: InboundEvent) {
        let key = event.conversation_key();
        if !event.is_proactive() {
            self.record_user_message(&key, &event).await;
        }

        let outcome = self.gate.evaluate(&event).await;
        match outcome {
            AdmissionOutcome::Reply { task, mandatory } => {
                tracing::debug!(conversation = %key, task_id = %task.id, mandatory, "message admitted");
                self.dispatch_admitted(task, event).await;
            }
            AdmissionOutcome::Queued => {
                tracing::debug!(conversation = %key, "message waiting for a free slot");
            }
            AdmissionOutcome::Rejected(reason) => {
                tracing::debug!(conversation = %key, reason = ?reason, "message rejected");
            }
        }
    }

    async fn record_user_message(&self, key: &ConversationKey, event: &InboundEvent) {
        let now = Utc::now();
        self.state
            .update_conversation(
                key,
                event.chat_type,
                event.group_id.clone().map(|g| g.into_inner()),
                &event.sender_id,
                |s| {
                    s.last_user_at = Some(now);
                    if window_rolled(s.msg_window_start, now) {
                        s.msg_window_start = now;
                        s.msg_count = 0;
                    }
                    s.msg_count += 1;
                    s.last_message = event.text.clone();
                },
            )
            .await;
        self.state.remember_conversation(key).await;
        self.desire.note_user_reply(&event.sender_id, now).await;
    }

    /// An admitted reactive group message joins its burst window; everything
    /// else generates immediately.
    async fn dispatch_admitted(self: Arc<Self>, task: TaskRecord, event: InboundEvent) {
        if self.cfg.burst.enabled && !event.is_proactive() {
            if let Some(group) = event.group_key() {
                let superseded = self.burst.offer(group, event, task).await;
                if let Some(superseded) = superseded {
                    // A newer message from the same sender took over; the old
                    // task releases its slot without producing output.
                    self.finish_task(&superseded, true);
                }
                return;
            }
        }
        self.spawn_generation(task, GenerationRequest::Single(event));
    }

    async fn burst_loop(self: Arc<Self>, mut rx: mpsc::Receiver<BurstFlush>, shutdown: CancellationToken) {
        loop {
            let flush = tokio::select! {
                _ = shutdown.cancelled() => return,
                flush = rx.recv() => match flush {
                    Some(flush) => flush,
                    None => return,
                },
            };
            for folded in &flush.folded_tasks {
                self.clone().finish_task(folded, true);
            }
            self.clone().spawn_generation(flush.primary_task, flush.request);
        }
    }

    async fn proactive_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<InboundEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            self.clone().handle_inbound(event).await;
        }
    }

    fn spawn_generation(self: Arc<Self>, task: TaskRecord, request: GenerationRequest) {
        tokio::spawn(self.generate_and_enqueue(task, request));
    }

    async fn generate_and_enqueue(self: Arc<Self>, task: TaskRecord, request: GenerationRequest) {
        let started = Instant::now();
        let generated = self.generator.generate(&request).await;
        match generated {
            Ok(reply) => {
                tracing::info!(
                    conversation = %task.conversation,
                    task_id = %task.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "reply generated"
                );
                if reply.text.trim().is_empty() && reply.resource_refs.is_empty() {
                    tracing::debug!(task_id = %task.id, "generator produced nothing to send");
                } else {
                    let proactive =
                        matches!(&request, GenerationRequest::Single(event) if event.is_proactive());
                    let item = SendQueueItem::from_reply(
                        task.id,
                        task.conversation.clone(),
                        &reply,
                        request.primary_text(),
                        proactive,
                    );
                    if self.delivery_tx.send(item).await.is_err() {
                        tracing::error!(task_id = %task.id, "delivery queue closed; dropping reply");
                    }
                }
                self.finish_task(&task, false);
            }
            Err(e) => {
                tracing::error!(
                    conversation = %task.conversation,
                    task_id = %task.id,
                    error = %e,
                    "reply generation failed"
                );
                self.finish_task(&task, false);
            }
        }
    }

    async fn receipt_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<DeliveryReceipt>,
        shutdown: CancellationToken,
    ) {
        loop {
            let receipt = tokio::select! {
                _ = shutdown.cancelled() => return,
                receipt = rx.recv() => match receipt {
                    Some(receipt) => receipt,
                    None => return,
                },
            };
            self.after_reply_delivered(&receipt).await;
        }
    }

    /// Conversation bookkeeping once a reply actually left through the sink.
    /// Suppressed or failed sends never reach here, so proactive quotas and
    /// the strike ladder only count messages the user could see.
    async fn after_reply_delivered(&self, receipt: &DeliveryReceipt) {
        let Some(snapshot) = self.state.conversation(&receipt.conversation).await else {
            tracing::warn!(
                conversation = %receipt.conversation,
                "delivered reply for an unknown conversation"
            );
            return;
        };
        let sender = SenderId::new(snapshot.user_id.clone());
        self.state
            .update_conversation(
                &receipt.conversation,
                snapshot.chat_type,
                snapshot.group_id.clone(),
                &sender,
                |s| {
                    s.last_bot_at = Some(receipt.sent_at);
                },
            )
            .await;
        if receipt.proactive {
            self.desire
                .note_proactive_sent(&receipt.conversation, receipt.sent_at)
                .await;
        }
    }

    /// Releases the task's scheduler slot; a promoted waiter is dispatched as
    /// if freshly admitted. Cancelled tasks never enqueue output.
    fn finish_task(self: Arc<Self>, task: &TaskRecord, cancelled: bool) {
        let promoted = if cancelled {
            self.scheduler.cancel(&task.conversation, task.id)
        } else {
            self.scheduler.complete(&task.conversation, task.id)
        };
        if let Some(promoted) = promoted {
            tracing::info!(
                conversation = %promoted.task.conversation,
                task_id = %promoted.task.id,
                waited_ms = promoted.waited_ms,
                "queued message promoted"
            );
            // Promotion activates a task without passing the gate again.
            self.gate.note_task_activated(&promoted.task.conversation);
            tokio::spawn(self.dispatch_admitted(promoted.task, promoted.event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConversationState;
    use async_trait::async_trait;
    use rg_events::{ChatType, GeneratedReply, GroupId, MessageId, ProactiveOrigin};
    use rg_oracles::{
        GateSignals, InterestScore, InterestVerdict, ReplyDecision, SimilarityJudgement,
    };
    use std::time::Duration;
    use uuid::Uuid;

    struct AlwaysConsider;

    #[async_trait]
    impl InterestScorer for AlwaysConsider {
        async fn score(
            &self,
            _event: &InboundEvent,
            _signals: &GateSignals,
        ) -> rg_oracles::Result<InterestScore> {
            Ok(InterestScore {
                verdict: InterestVerdict::Consider,
                score: 0.9,
                reason: "test".to_string(),
            })
        }
    }

    struct AlwaysYes;

    #[async_trait]
    impl DecisionOracle for AlwaysYes {
        async fn decide(
            &self,
            _event: &InboundEvent,
            _signals: &GateSignals,
        ) -> rg_oracles::Result<ReplyDecision> {
            Ok(ReplyDecision {
                should_reply: true,
                confidence: 1.0,
                reason: "test".to_string(),
            })
        }
    }

    struct NeverSimilar;

    #[async_trait]
    impl SimilarityOracle for NeverSimilar {
        async fn similar(&self, _a: &str, _b: &str) -> rg_oracles::Result<SimilarityJudgement> {
            Ok(SimilarityJudgement::dissimilar())
        }
    }

    /// Echoes the request text back, optionally after a simulated delay.
    struct EchoGenerator {
        delay: Duration,
    }

    #[async_trait]
    impl ReplyGenerator for EchoGenerator {
        async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedReply> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let text = match request {
                GenerationRequest::Single(event) => format!("re: {}", event.text),
                GenerationRequest::Merged(merged) => format!("re: {} voices", merged.entries.len()),
            };
            Ok(GeneratedReply {
                text,
                resource_refs: Vec::new(),
                has_tool_side_effect: false,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ConversationKey, String)>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn deliver(
            &self,
            conversation: &ConversationKey,
            text: &str,
            _resource_refs: &[String],
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .await
                .push((conversation.clone(), text.to_string()));
            Ok(())
        }
    }

    fn pipeline_with(
        cfg: PipelineConfig,
        generator_delay: Duration,
    ) -> (Arc<ReplyPipeline>, Arc<RecordingSink>, CancellationToken) {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = ReplyPipeline::new(
            cfg,
            StateHandle::in_memory(),
            Arc::new(AlwaysConsider),
            Arc::new(AlwaysYes),
            Arc::new(NeverSimilar),
            Arc::new(EchoGenerator {
                delay: generator_delay,
            }),
            sink.clone(),
        );
        (pipeline, sink, CancellationToken::new())
    }

    fn private_event(sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            message_id: MessageId::new(Uuid::new_v4().to_string()),
            chat_type: ChatType::Private,
            group_id: None,
            sender_id: SenderId::new(sender),
            sender_name: sender.to_string(),
            is_explicit_mention: false,
            is_name_mention: false,
            text: text.to_string(),
            received_at: Utc::now(),
            proactive: None,
        }
    }

    fn group_event(sender: &str, text: &str, mention: bool) -> InboundEvent {
        InboundEvent {
            message_id: MessageId::new(Uuid::new_v4().to_string()),
            chat_type: ChatType::Group,
            group_id: Some(GroupId::new("g1")),
            sender_id: SenderId::new(sender),
            sender_name: sender.to_string(),
            is_explicit_mention: mention,
            is_name_mention: false,
            text: text.to_string(),
            received_at: Utc::now(),
            proactive: None,
        }
    }

    async fn settle(sink: &RecordingSink, expected: usize) {
        for _ in 0..200 {
            if sink.sent.lock().await.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Waits for the receipt loop to apply post-send bookkeeping.
    async fn settle_state(
        pipeline: &ReplyPipeline,
        key: &ConversationKey,
        ready: impl Fn(&ConversationState) -> bool,
    ) -> ConversationState {
        for _ in 0..200 {
            if let Some(state) = pipeline.state.conversation(key).await {
                if ready(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        pipeline
            .state
            .conversation(key)
            .await
            .expect("conversation recorded")
    }

    #[tokio::test(start_paused = true)]
    async fn private_message_flows_end_to_end() {
        let (pipeline, sink, shutdown) = pipeline_with(PipelineConfig::default(), Duration::ZERO);
        let runner = pipeline.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        tokio::task::yield_now().await;

        pipeline
            .clone()
            .handle_inbound(private_event("alice", "hello"))
            .await;
        settle(&sink, 1).await;

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "re: hello");
        assert_eq!(sent[0].0.as_str(), "private:alice");
        drop(sent);

        let key = ConversationKey::derive(ChatType::Private, None, &SenderId::new("alice"));
        let state = settle_state(&pipeline, &key, |s| s.last_bot_at.is_some()).await;
        assert_eq!(state.msg_count, 1);
        assert!(state.last_bot_at.is_some());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_merges_distinct_senders_into_one_reply() {
        let mut cfg = PipelineConfig::default();
        cfg.burst.window_ms = 1_000;
        cfg.gate.baseline = 0.0;
        cfg.gate.threshold = 0.1;
        let (pipeline, sink, shutdown) = pipeline_with(cfg, Duration::ZERO);
        let runner = pipeline.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        tokio::task::yield_now().await;

        for sender in ["a", "b", "c"] {
            pipeline
                .clone()
                .handle_inbound(group_event(sender, "simultaneous", false))
                .await;
        }
        settle(&sink, 1).await;

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1, "one merged reply for the burst");
        assert_eq!(sent[0].1, "re: 3 voices");
        drop(sent);

        // Folded tasks released their slots.
        for sender in ["a", "b", "c"] {
            let key = group_event(sender, "", false).conversation_key();
            assert_eq!(pipeline.scheduler.active_count(&key), 0);
        }
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_same_sender_message_is_cancelled() {
        let mut cfg = PipelineConfig::default();
        cfg.burst.window_ms = 1_000;
        // Both messages must clear admission before the window flushes.
        cfg.scheduler.max_concurrent_per_conversation = 2;
        let (pipeline, sink, shutdown) = pipeline_with(cfg, Duration::ZERO);
        let runner = pipeline.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        tokio::task::yield_now().await;

        pipeline
            .clone()
            .handle_inbound(group_event("alice", "first", true))
            .await;
        pipeline
            .clone()
            .handle_inbound(group_event("alice", "second", true))
            .await;
        settle(&sink, 1).await;

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1, "only the latest message generates");
        assert_eq!(sent[0].1, "re: second");
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn queued_message_is_promoted_after_completion() {
        let mut cfg = PipelineConfig::default();
        cfg.scheduler.max_concurrent_per_conversation = 1;
        cfg.scheduler.queue_timeout_ms = 120_000;
        let (pipeline, sink, shutdown) = pipeline_with(cfg, Duration::from_secs(2));
        let runner = pipeline.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        tokio::task::yield_now().await;

        pipeline
            .clone()
            .handle_inbound(private_event("alice", "one"))
            .await;
        pipeline
            .clone()
            .handle_inbound(private_event("alice", "two"))
            .await;
        settle(&sink, 2).await;

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 2, "second message promoted after the first");
        assert_eq!(sent[0].1, "re: one");
        assert_eq!(sent[1].1, "re: two");
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_event_updates_quota_and_delivers() {
        let (pipeline, sink, shutdown) = pipeline_with(PipelineConfig::default(), Duration::ZERO);
        let runner = pipeline.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        tokio::task::yield_now().await;

        // Seed the conversation, then inject a synthetic proactive event the
        // way the desire engine would.
        pipeline
            .clone()
            .handle_inbound(private_event("alice", "hi"))
            .await;
        settle(&sink, 1).await;
        let mut event = private_event("alice", "");
        event.proactive = Some(ProactiveOrigin {
            is_first_after_user: true,
        });
        pipeline.clone().handle_inbound(event).await;
        settle(&sink, 2).await;

        assert_eq!(sink.sent.lock().await.len(), 2);
        let key = ConversationKey::derive(ChatType::Private, None, &SenderId::new("alice"));
        let state = settle_state(&pipeline, &key, |s| s.proactive_count == 1).await;
        assert_eq!(state.proactive_count, 1);
        assert_eq!(state.daily_proactive_count, 1);
        assert!(state.last_proactive_at.is_some());
        shutdown.cancel();
    }

    struct FailingSink;

    #[async_trait]
    impl DeliverySink for FailingSink {
        async fn deliver(
            &self,
            _conversation: &ConversationKey,
            _text: &str,
            _resource_refs: &[String],
        ) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("transport down"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_leaves_proactive_quota_untouched() {
        let pipeline = ReplyPipeline::new(
            PipelineConfig::default(),
            StateHandle::in_memory(),
            Arc::new(AlwaysConsider),
            Arc::new(AlwaysYes),
            Arc::new(NeverSimilar),
            Arc::new(EchoGenerator {
                delay: Duration::ZERO,
            }),
            Arc::new(FailingSink),
        );
        let shutdown = CancellationToken::new();
        let runner = pipeline.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });
        tokio::task::yield_now().await;

        pipeline
            .clone()
            .handle_inbound(private_event("alice", "hi"))
            .await;
        let mut event = private_event("alice", "");
        event.proactive = Some(ProactiveOrigin {
            is_first_after_user: true,
        });
        pipeline.clone().handle_inbound(event).await;

        // Enough virtual time for the drain loop to attempt both sends.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let key = ConversationKey::derive(ChatType::Private, None, &SenderId::new("alice"));
        let state = pipeline.state.conversation(&key).await.expect("state");
        assert_eq!(state.proactive_count, 0);
        assert_eq!(state.daily_proactive_count, 0);
        assert!(state.last_bot_at.is_none());
        assert!(state.last_proactive_at.is_none());
        let fatigue = pipeline.state.user_fatigue(&SenderId::new("alice")).await;
        assert_eq!(fatigue.strikes, 0);
        assert!(fatigue.last_proactive_at.is_none());
        shutdown.cancel();
    }
}
