use crate::traits::MessagingChannel;
use crate::types::{MessageTs, SlackThread};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;

pub const PLACEHOLDER_TEXT: &str = "🔄 nao is answering...";
pub const STOP_BUTTON_TEXT: &str = "Generating response... ";
pub const STOP_BUTTON_LABEL: &str = "Stop Generation";
pub const STOP_ACTION_ID: &str = "stop_generation";

pub fn stop_button_block() -> serde_json::Value {
    serde_json::json!({
        "type": "actions",
        "elements": [{
            "type": "button",
            "text": { "type": "plain_text", "text": STOP_BUTTON_LABEL, "emoji": true },
            "style": "primary",
            "action_id": STOP_ACTION_ID,
        }]
    })
}

/// One item of a relayed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFragment {
    Text(String),
    /// The model moved on to another step; its text replaces what is shown.
    StepBoundary,
}

impl From<String> for RelayFragment {
    fn from(text: String) -> Self {
        RelayFragment::Text(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySummary {
    /// Text of the last step, as last shown in the thread.
    pub text: String,
    pub updates_sent: usize,
    pub updates_failed: usize,
}

/// Best-effort relay of one session's text into a chat thread.
///
/// Every platform call failure is logged and swallowed; the session never sees it.
pub struct MessageRelay {
    channel: Arc<dyn MessagingChannel>,
    thread: SlackThread,
    placeholder_ts: Option<MessageTs>,
    button_ts: Option<MessageTs>,
}

impl MessageRelay {
    pub fn new(channel: Arc<dyn MessagingChannel>, thread: SlackThread) -> Self {
        Self {
            channel,
            thread,
            placeholder_ts: None,
            button_ts: None,
        }
    }

    pub fn thread(&self) -> &SlackThread {
        &self.thread
    }

    pub async fn post_placeholder(&mut self) {
        match self
            .channel
            .post_message(
                &self.thread.channel,
                Some(&self.thread.thread_ts),
                PLACEHOLDER_TEXT,
                None,
            )
            .await
        {
            Ok(ts) => self.placeholder_ts = Some(ts),
            Err(e) => tracing::warn!(error = %e, "slack placeholder post failed"),
        }
    }

    pub async fn post_stop_button(&mut self) {
        match self
            .channel
            .post_message(
                &self.thread.channel,
                Some(&self.thread.thread_ts),
                STOP_BUTTON_TEXT,
                Some(serde_json::json!([stop_button_block()])),
            )
            .await
        {
            Ok(ts) => self.button_ts = Some(ts),
            Err(e) => tracing::warn!(error = %e, "slack stop button post failed"),
        }
    }

    /// Accumulates text fragments and edits the answer message whenever the
    /// text added since the last edit contains a line break. Whatever is left
    /// unsent when the stream ends is flushed once.
    ///
    /// After a step boundary the first new text starts over, so the thread
    /// shows only the latest step's text.
    pub async fn relay<S, F>(&mut self, fragments: S) -> RelaySummary
    where
        S: Stream<Item = F> + Send,
        F: Into<RelayFragment> + Send,
    {
        let mut fragments = std::pin::pin!(fragments);
        let mut summary = RelaySummary::default();
        let mut sent_len = 0usize;
        let mut new_step = false;

        while let Some(fragment) = fragments.next().await {
            let text = match fragment.into() {
                RelayFragment::StepBoundary => {
                    new_step = true;
                    continue;
                }
                RelayFragment::Text(text) if text.is_empty() => continue,
                RelayFragment::Text(text) => text,
            };
            if new_step {
                summary.text.clear();
                sent_len = 0;
                new_step = false;
            }
            summary.text.push_str(&text);
            if summary.text[sent_len..].contains('\n') {
                self.push_update(&mut summary).await;
                sent_len = summary.text.len();
            }
        }

        if sent_len < summary.text.len() {
            self.push_update(&mut summary).await;
        }
        summary
    }

    async fn push_update(&self, summary: &mut RelaySummary) {
        let ts = self
            .placeholder_ts
            .as_ref()
            .unwrap_or(&self.thread.thread_ts);
        match self
            .channel
            .update_message(&self.thread.channel, ts, &summary.text, None)
            .await
        {
            Ok(()) => summary.updates_sent += 1,
            Err(e) => {
                summary.updates_failed += 1;
                tracing::warn!(error = %e, "slack answer update failed");
            }
        }
    }

    /// Swaps the stop button for a permanent link to the conversation.
    pub async fn finish(&self, conversation_url: &str) {
        let ts = self.button_ts.as_ref().unwrap_or(&self.thread.thread_ts);
        let text = format!("<{conversation_url}|View full conversation>");
        if let Err(e) = self
            .channel
            .update_message(&self.thread.channel, ts, &text, Some(serde_json::json!([])))
            .await
        {
            tracing::warn!(error = %e, "slack stop button replacement failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelId;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Post { text: String, blocks: bool },
        Update { ts: String, text: String },
    }

    #[derive(Default)]
    struct FakeChannel {
        calls: Mutex<Vec<Call>>,
        fail_updates: bool,
    }

    impl FakeChannel {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl MessagingChannel for FakeChannel {
        async fn post_message(
            &self,
            _channel: &ChannelId,
            _thread_ts: Option<&MessageTs>,
            text: &str,
            blocks: Option<serde_json::Value>,
        ) -> Result<MessageTs> {
            let mut calls = self.calls.lock().expect("calls");
            calls.push(Call::Post {
                text: text.to_string(),
                blocks: blocks.is_some(),
            });
            Ok(MessageTs::new(format!("ts-{}", calls.len())))
        }

        async fn update_message(
            &self,
            _channel: &ChannelId,
            ts: &MessageTs,
            text: &str,
            _blocks: Option<serde_json::Value>,
        ) -> Result<()> {
            self.calls.lock().expect("calls").push(Call::Update {
                ts: ts.to_string(),
                text: text.to_string(),
            });
            if self.fail_updates {
                return Err(anyhow!("ratelimited"));
            }
            Ok(())
        }
    }

    fn fragments(parts: &[&str]) -> futures_util::stream::Iter<std::vec::IntoIter<String>> {
        let owned: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        futures_util::stream::iter(owned)
    }

    #[tokio::test]
    async fn updates_only_on_new_lines_and_flushes_tail() {
        let channel = Arc::new(FakeChannel::default());
        let mut relay = MessageRelay::new(channel.clone(), SlackThread::new("C1", "100.1"));
        relay.post_placeholder().await;
        relay.post_stop_button().await;

        let summary = relay
            .relay(fragments(&["Hel", "lo", "\nwor", "ld", " and", " more\n", "tail"]))
            .await;
        relay.finish("http://localhost:3000/chat-1").await;

        assert_eq!(summary.text, "Hello\nworld and more\ntail");
        assert_eq!(summary.updates_sent, 3);
        assert_eq!(
            channel.calls(),
            vec![
                Call::Post {
                    text: PLACEHOLDER_TEXT.to_string(),
                    blocks: false
                },
                Call::Post {
                    text: STOP_BUTTON_TEXT.to_string(),
                    blocks: true
                },
                Call::Update {
                    ts: "ts-1".to_string(),
                    text: "Hello\nwor".to_string()
                },
                Call::Update {
                    ts: "ts-1".to_string(),
                    text: "Hello\nworld and more\n".to_string()
                },
                Call::Update {
                    ts: "ts-1".to_string(),
                    text: "Hello\nworld and more\ntail".to_string()
                },
                Call::Update {
                    ts: "ts-2".to_string(),
                    text: "<http://localhost:3000/chat-1|View full conversation>".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn no_trailing_newline_still_flushes_everything() {
        let channel = Arc::new(FakeChannel::default());
        let mut relay = MessageRelay::new(channel.clone(), SlackThread::new("C1", "100.1"));
        let summary = relay.relay(fragments(&["just ", "one line"])).await;

        assert_eq!(summary.updates_sent, 1);
        // Without a placeholder the thread root is edited.
        assert_eq!(
            channel.calls(),
            vec![Call::Update {
                ts: "100.1".to_string(),
                text: "just one line".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn a_new_step_replaces_the_shown_text() {
        let channel = Arc::new(FakeChannel::default());
        let mut relay = MessageRelay::new(channel.clone(), SlackThread::new("C1", "100.1"));
        relay.post_placeholder().await;
        let parts = vec![
            RelayFragment::Text("Let me check the tables.".to_string()),
            RelayFragment::StepBoundary,
            RelayFragment::StepBoundary,
            RelayFragment::Text("There are ".to_string()),
            RelayFragment::Text("42 users.".to_string()),
        ];
        let summary = relay.relay(futures_util::stream::iter(parts)).await;

        assert_eq!(summary.text, "There are 42 users.");
        let updates: Vec<Call> = channel
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .collect();
        assert_eq!(
            updates,
            vec![Call::Update {
                ts: "ts-1".to_string(),
                text: "There are 42 users.".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn failed_updates_do_not_stop_the_relay() {
        let channel = Arc::new(FakeChannel {
            fail_updates: true,
            ..FakeChannel::default()
        });
        let mut relay = MessageRelay::new(channel.clone(), SlackThread::new("C1", "100.1"));
        relay.post_placeholder().await;
        let summary = relay.relay(fragments(&["a\n", "b\n", "c"])).await;
        assert_eq!(summary.text, "a\nb\nc");
        assert_eq!(summary.updates_failed, 3);
        assert_eq!(summary.updates_sent, 0);
    }
}
