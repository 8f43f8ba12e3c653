//! Admission control and delivery scheduling for a chat-bot reply pipeline.
//!
//! Inbound messages pass the admission gate (attention window, fatigue
//! backoff, interest accumulator, decision oracle), contend for a
//! per-conversation concurrency slot, optionally merge with near-simultaneous
//! group messages, and hand their generated reply to the delivery queue for
//! dedup, pacing, and repeat suppression. A periodic desire engine proposes
//! proactive replies for idle conversations through the same path.

pub mod burst;
pub mod config;
pub mod delivery;
pub mod desire;
pub mod fatigue;
pub mod gate;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use burst::{BurstFlush, BurstMerger};
pub use config::PipelineConfig;
pub use delivery::{DeliveryQueue, DeliveryReceipt, SendQueueItem};
pub use desire::DesireEngine;
pub use fatigue::{FatigueTracker, FatigueVerdict, evaluate_fatigue};
pub use gate::{AdmissionGate, AdmissionOutcome, GateStatsSnapshot, RejectReason};
pub use pipeline::ReplyPipeline;
pub use scheduler::{Admit, ConversationScheduler, Promoted, TaskRecord, TaskState};
pub use state::{ConversationState, MemoryStateStore, StateHandle, StateStore, UserFatigueState};
pub use telemetry::{init_tracing, install_panic_hook};
