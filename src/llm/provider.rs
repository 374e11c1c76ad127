use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::types::{ChatMessage, ModelError, ModelResponse};

/// A vision model endpoint. One request in flight at a time.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Identifier for logs.
    fn name(&self) -> &str;

    /// Send the conversation and wait for the complete, parsed reply.
    /// Cancelling `cancel` tears the transport down and yields
    /// [`ModelError::Cancelled`].
    async fn request(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError>;

    /// Abort whatever request is in flight. A no-op when idle.
    fn abort(&self) {}
}
