//! Event data model for the replygate pipeline.
//!
//! Pure types plus the two outward-facing traits: the reply generator that
//! produces text for an admitted task, and the delivery sink that hands
//! finished replies to the transport.

mod traits;
mod types;

pub use traits::{DeliverySink, ReplyGenerator};
pub use types::{
    ChatType, ConversationKey, GeneratedReply, GenerationRequest, GroupId, GroupKey, InboundEvent,
    MergedMessage, MessageId, ProactiveOrigin, SenderEntry, SenderId,
};
