use crate::error::Result;
use crate::types::{ChatMessage, StreamChunk, ToolDefinition};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// A model that turns a prompt into a stream of chunks.
///
/// Dropping the returned stream aborts the underlying request.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn model(&self) -> &str;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream>;
}
