use crate::relay::STOP_ACTION_ID;
use crate::types::{SlackThread, strip_mentions};
use serde::Deserialize;

/// Body of `POST /slack/events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackEnvelope {
    UrlVerification { challenge: String },
    EventCallback { event: SlackEvent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
}

impl SlackEvent {
    pub fn is_app_mention(&self) -> bool {
        self.kind == "app_mention" && self.bot_id.is_none()
    }

    /// The thread this event belongs to; a top-level mention starts its own thread.
    pub fn thread(&self) -> Option<SlackThread> {
        let channel = self.channel.as_deref()?;
        let root = self.thread_ts.as_deref().or(self.ts.as_deref())?;
        Some(SlackThread::new(channel, root))
    }

    pub fn prompt(&self) -> String {
        strip_mentions(self.text.as_deref().unwrap_or_default())
    }
}

/// The JSON `payload` field of an interactivity request.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackInteraction {
    #[serde(default)]
    actions: Vec<SlackAction>,
    #[serde(default)]
    channel: Option<SlackIdRef>,
    #[serde(default)]
    message: Option<SlackMessageRef>,
    #[serde(default)]
    container: Option<SlackContainer>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackAction {
    action_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackIdRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackMessageRef {
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackContainer {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

impl SlackInteraction {
    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    pub fn is_stop_request(&self) -> bool {
        self.actions.iter().any(|a| a.action_id == STOP_ACTION_ID)
    }

    /// Thread of the message carrying the clicked button.
    pub fn thread(&self) -> Option<SlackThread> {
        let channel = self
            .channel
            .as_ref()
            .map(|c| c.id.clone())
            .or_else(|| self.container.as_ref().and_then(|c| c.channel_id.clone()))?;
        let root = self
            .message
            .as_ref()
            .and_then(|m| m.thread_ts.clone().or_else(|| m.ts.clone()))
            .or_else(|| self.container.as_ref().and_then(|c| c.thread_ts.clone()))?;
        Some(SlackThread::new(channel, root))
    }
}

/// Extracts and parses `payload` from an `application/x-www-form-urlencoded` body
/// already decoded into key/value pairs.
pub fn parse_interaction_form<'a>(
    mut fields: impl Iterator<Item = (&'a str, &'a str)>,
) -> Option<SlackInteraction> {
    let (_, payload) = fields.find(|(k, _)| *k == "payload")?;
    match SlackInteraction::from_payload(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "invalid slack interaction payload");
            None
        }
    }
}
