//! Chat persistence.
//!
//! The session runtime only sees [`ChatStore`]; the server picks the SQLite
//! implementation when a database path is configured and the in-memory one
//! otherwise.

mod memory;
mod sqlite;

pub use memory::MemoryChatStore;
pub use sqlite::SqliteChatStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nao_llm::{ChatMessage, Provider, Role, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const TITLE_MAX_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub slack_thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChat {
    pub project_id: String,
    pub user_id: String,
    pub title: String,
    pub slack_thread_id: Option<String>,
}

impl NewChat {
    /// Title is the first characters of the opening user text.
    pub fn from_first_text(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        text: &str,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            title: text.chars().take(TITLE_MAX_CHARS).collect(),
            slack_thread_id: None,
        }
    }

    pub fn with_slack_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.slack_thread_id = Some(thread_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// One UI-level message. An assistant message keeps every model/tool turn
/// it produced so the next request can replay tool calls faithfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    #[serde(default)]
    pub turns: Vec<ChatMessage>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::User,
            text: text.into(),
            turns: Vec::new(),
            stop_reason: None,
            error: None,
            token_usage: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>, turns: Vec<ChatMessage>) -> Self {
        Self {
            role: MessageRole::Assistant,
            turns,
            ..Self::user(text)
        }
    }

    fn apply(&mut self, outcome: MessageOutcome) {
        if outcome.stop_reason.is_some() {
            self.stop_reason = outcome.stop_reason;
        }
        if outcome.error.is_some() {
            self.error = outcome.error;
        }
        if outcome.token_usage.is_some() {
            self.token_usage = outcome.token_usage;
        }
    }
}

/// Terminal bookkeeping attached when a message is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOutcome {
    pub stop_reason: Option<String>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_total_tokens: u32,
    pub input_no_cache_tokens: u32,
    pub input_cache_read_tokens: u32,
    pub input_cache_write_tokens: u32,
    pub output_total_tokens: u32,
    pub output_reasoning_tokens: u32,
    pub output_text_tokens: u32,
    pub total_tokens: u32,
}

impl From<&Usage> for TokenUsage {
    fn from(usage: &Usage) -> Self {
        Self {
            input_total_tokens: usage.prompt_tokens,
            input_no_cache_tokens: usage.no_cache_prompt_tokens(),
            input_cache_read_tokens: usage.cache_read_tokens,
            input_cache_write_tokens: usage.cache_write_tokens,
            output_total_tokens: usage.completion_tokens,
            output_reasoning_tokens: usage.reasoning_tokens,
            output_text_tokens: usage.text_completion_tokens(),
            total_tokens: usage.total_tokens(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedChat {
    pub chat: ChatRecord,
    pub messages: Vec<StoredMessage>,
}

impl LoadedChat {
    /// Flattens stored messages into the model's message history.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        for message in &self.messages {
            match message.role {
                MessageRole::User => out.push(ChatMessage::user(message.text.clone())),
                MessageRole::Assistant if !message.turns.is_empty() => {
                    out.extend(message.turns.iter().cloned());
                }
                MessageRole::Assistant if !message.text.is_empty() => {
                    out.push(ChatMessage::assistant(message.text.clone()));
                }
                MessageRole::Assistant => {}
            }
        }
        drop_unanswered_tool_calls(out)
    }
}

/// Pairs every assistant tool call with the results that directly follow it.
///
/// Providers reject a tool call without a result and a result without its
/// call; an interrupted turn can leave either behind anywhere in the history.
fn drop_unanswered_tool_calls(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    while let Some(mut message) = iter.next() {
        match message.role {
            Role::Assistant if !message.tool_calls.is_empty() => {
                let mut results = Vec::new();
                while let Some(result) = iter.next_if(|m| m.role == Role::Tool) {
                    results.push(result);
                }
                let answered: HashSet<String> = results
                    .iter()
                    .filter_map(|r| r.tool_call_id.clone())
                    .collect();
                message.tool_calls.retain(|call| answered.contains(&call.id));
                results.retain(|r| {
                    r.tool_call_id
                        .as_deref()
                        .is_some_and(|id| message.tool_calls.iter().any(|call| call.id == id))
                });
                if message.tool_calls.is_empty() && message.content.is_empty() {
                    continue;
                }
                out.push(message);
                out.extend(results);
            }
            Role::Tool => {}
            _ => out.push(message),
        }
    }
    out
}

/// Per-project provider credential.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectLlmConfig {
    pub provider: Provider,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub enabled_models: Vec<String>,
}

impl std::fmt::Debug for ProjectLlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLlmConfig")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("enabled_models", &self.enabled_models)
            .finish()
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn load_chat(&self, chat_id: &str) -> Result<Option<LoadedChat>>;

    async fn create_chat(&self, chat: NewChat, first_message: StoredMessage)
    -> Result<ChatRecord>;

    /// Inserts the message, or replaces the one with the same id.
    async fn upsert_message(
        &self,
        chat_id: &str,
        message: StoredMessage,
        outcome: MessageOutcome,
    ) -> Result<()>;

    async fn get_project_llm_config(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> Result<Option<ProjectLlmConfig>>;

    async fn set_project_llm_config(&self, project_id: &str, config: ProjectLlmConfig)
    -> Result<()>;

    async fn find_chat_by_slack_thread(&self, thread_id: &str) -> Result<Option<ChatRecord>>;
}
