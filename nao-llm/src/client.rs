use crate::anthropic::AnthropicClient;
use crate::backend::{ChatStream, ModelBackend};
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::provider::{Provider, ProviderOptions};
use crate::types::{ChatMessage, StreamChunk, ToolDefinition};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;

const TOOL_NAME_MAX_LEN: usize = 64;

/// Everything needed to talk to one model: the resolver's output.
#[derive(Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub options: ProviderOptions,
}

impl LlmConfig {
    pub fn new(provider: Provider, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: api_key.into(),
            base_url: None,
            options: provider.options(),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|url| !url.trim().is_empty());
        self
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        // No overall timeout: streams end on completion or when the caller drops them.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn provider(&self) -> Provider {
        self.config.provider
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.config.provider, model = %self.config.model))]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream> {
        let (tools_sanitized, forward, reverse) = sanitize_tools(tools);
        let messages_sanitized = sanitize_messages(messages, &forward);
        let stream = match self.config.provider {
            Provider::OpenAI => {
                OpenAiClient::new(self.client.clone(), &self.config)
                    .chat_stream(&messages_sanitized, &tools_sanitized)
                    .await?
            }
            Provider::Anthropic => {
                AnthropicClient::new(self.client.clone(), &self.config)
                    .chat_stream(&messages_sanitized, &tools_sanitized)
                    .await?
            }
        };
        Ok(Box::pin(stream.map(move |chunk| match chunk {
            Ok(StreamChunk::ToolCallStart { id, name }) => Ok(StreamChunk::ToolCallStart {
                id,
                name: reverse.get(&name).cloned().unwrap_or(name),
            }),
            other => other,
        })))
    }
}

#[async_trait]
impl ModelBackend for LlmClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream> {
        self.chat_stream(messages, tools).await
    }
}

/// Both providers accept `^[a-zA-Z0-9_-]{1,64}$`.
pub fn validate_tool_name_all_providers(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LlmError::InvalidInput("tool name is empty".to_string()));
    }
    if name.len() > TOOL_NAME_MAX_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} exceeds {TOOL_NAME_MAX_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

fn sanitize_tools(
    tools: &[ToolDefinition],
) -> (Vec<ToolDefinition>, HashMap<String, String>, HashMap<String, String>) {
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut forward: HashMap<String, String> = HashMap::new(); // original -> sanitized
    let mut reverse: HashMap<String, String> = HashMap::new(); // sanitized -> original
    let mut out = Vec::with_capacity(tools.len());

    for t in tools {
        let mut name = sanitize_tool_name(&t.name);
        if let Some(n) = used.get_mut(&name) {
            *n += 1;
            let suffix = format!("_{}", *n);
            name.truncate(TOOL_NAME_MAX_LEN - suffix.len());
            name.push_str(&suffix);
        } else {
            used.insert(name.clone(), 0);
        }
        forward.insert(t.name.clone(), name.clone());
        reverse.insert(name.clone(), t.name.clone());
        out.push(ToolDefinition {
            name,
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        });
    }

    (out, forward, reverse)
}

fn sanitize_messages(
    messages: &[ChatMessage],
    forward: &HashMap<String, String>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let mut m2 = m.clone();
        for tc in m2.tool_calls.iter_mut() {
            if let Some(s) = forward.get(&tc.name) {
                tc.name = s.clone();
            } else {
                // Tool may have left the catalog since this turn; still satisfy validation.
                tc.name = sanitize_tool_name(&tc.name);
            }
        }
        out.push(m2);
    }
    out
}

fn sanitize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(TOOL_NAME_MAX_LEN));
    for ch in name.chars().take(TOOL_NAME_MAX_LEN) {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "tool".to_string()
    } else {
        out
    }
}
