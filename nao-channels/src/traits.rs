use crate::types::{ChannelId, MessageTs};
use anyhow::Result;
use async_trait::async_trait;

/// A chat platform that can post and edit messages in threads.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Posts a message and returns its timestamp.
    async fn post_message(
        &self,
        channel: &ChannelId,
        thread_ts: Option<&MessageTs>,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<MessageTs>;

    /// Replaces the text (and blocks, when given) of an existing message.
    async fn update_message(
        &self,
        channel: &ChannelId,
        ts: &MessageTs,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<()>;
}
