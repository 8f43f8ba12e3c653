use crate::types::{ConversationKey, GeneratedReply, GenerationRequest};
use anyhow::Result;
use async_trait::async_trait;

/// External reply generation (prompting, RAG, persona). Invoked once per
/// admitted task.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply>;
}

/// Final transport. The core never opens sockets; delivery is this callback.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(
        &self,
        conversation: &ConversationKey,
        text: &str,
        resource_refs: &[String],
    ) -> Result<()>;
}
