use crate::traits::MessagingChannel;
use crate::types::{ChannelId, MessageTs};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Slack Web API client for the bot token.
#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl SlackClient {
    pub fn new(bot_token: &str) -> Result<Self> {
        let token = bot_token.trim();
        if token.is_empty() {
            return Err(anyhow!("slack bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: token.to_string(),
            api_base: SLACK_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<SlackApiResponse> {
        let response = self
            .http
            .post(self.api_url(method))
            .bearer_auth(&self.bot_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body: SlackApiResponse = response.json().await?;
        if !status.is_success() || !body.ok {
            return Err(anyhow!(
                "slack {method} failed: status={} error={}",
                status,
                body.error.as_deref().unwrap_or("unknown")
            ));
        }
        Ok(body)
    }
}

fn message_payload(
    channel: &ChannelId,
    text: &str,
    blocks: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "channel": channel.as_str(),
        "text": text,
    });
    if let Some(blocks) = blocks {
        payload["blocks"] = blocks;
    }
    payload
}

#[async_trait]
impl MessagingChannel for SlackClient {
    #[tracing::instrument(level = "debug", skip(self, text, blocks))]
    async fn post_message(
        &self,
        channel: &ChannelId,
        thread_ts: Option<&MessageTs>,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<MessageTs> {
        let mut payload = message_payload(channel, text, blocks);
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = serde_json::json!(thread_ts.as_str());
        }
        let body = self.call("chat.postMessage", payload).await?;
        body.ts
            .map(MessageTs::from)
            .ok_or_else(|| anyhow!("slack chat.postMessage returned no ts"))
    }

    #[tracing::instrument(level = "debug", skip(self, text, blocks))]
    async fn update_message(
        &self,
        channel: &ChannelId,
        ts: &MessageTs,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut payload = message_payload(channel, text, blocks);
        payload["ts"] = serde_json::json!(ts.as_str());
        self.call("chat.update", payload).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_is_rejected() {
        assert!(SlackClient::new("   ").is_err());
    }

    #[test]
    fn payload_carries_blocks_only_when_given() {
        let channel = ChannelId::from("C1");
        let plain = message_payload(&channel, "hi", None);
        assert!(plain.get("blocks").is_none());
        let with_blocks = message_payload(&channel, "hi", Some(serde_json::json!([])));
        assert_eq!(with_blocks["blocks"], serde_json::json!([]));
    }

    #[test]
    fn api_base_override_is_trimmed() {
        let client = SlackClient::new("xoxb-1")
            .expect("client")
            .with_api_base("http://127.0.0.1:9/api/");
        assert_eq!(client.api_url("chat.update"), "http://127.0.0.1:9/api/chat.update");
    }
}
