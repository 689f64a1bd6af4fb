use crate::client::LlmConfig;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Reasoning, Role, StreamChunk, ToolDefinition, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 8192;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    messages_url: String,
    thinking_budget_tokens: Option<u32>,
    parallel_tool_use: bool,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, config: &LlmConfig) -> Self {
        let base = config
            .base_url
            .as_deref()
            .unwrap_or(ANTHROPIC_BASE_URL)
            .trim_end_matches('/');
        Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            messages_url: format!("{base}/messages"),
            thinking_budget_tokens: config.options.thinking_budget_tokens,
            parallel_tool_use: config.options.parallel_tool_use,
        }
    }

    fn request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> AnthropicRequest {
        let mut req = AnthropicRequest::new(&self.model, messages, tools, stream);
        if let Some(budget_tokens) = self.thinking_budget_tokens {
            req.max_tokens = budget_tokens.saturating_add(ANTHROPIC_MAX_TOKENS);
            req.thinking = Some(AnthropicThinking {
                r#type: "enabled".to_string(),
                budget_tokens,
            });
        }
        if !req.tools.is_empty() {
            req.tool_choice = Some(AnthropicToolChoice {
                r#type: "auto".to_string(),
                disable_parallel_tool_use: !self.parallel_tool_use,
            });
        }
        req
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = self.request(messages, tools, true);

        let response = self
            .http
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::status("anthropic", status, body));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        Ok(Box::pin(anthropic_chunks(sse)))
    }
}

fn anthropic_chunks<S>(sse: Pin<Box<S>>) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<SseItem>> + Send + ?Sized + 'static,
{
    let state = AnthropicStreamState::default();
    futures_util::stream::unfold((sse, state), |(mut sse, mut state)| async move {
        loop {
            let next = sse.as_mut().next().await?;
            let (event_name, data) = match next {
                Ok(v) => v,
                Err(e) => return Some((Err(e), (sse, state))),
            };

            match event_name.as_str() {
                "message_start" => {
                    if let Ok(v) = serde_json::from_str::<AnthropicMessageStart>(&data) {
                        state.usage = v.message.usage.into();
                    }
                }
                "content_block_start" => {
                    if let Ok(v) = serde_json::from_str::<AnthropicContentBlockStart>(&data) {
                        if let AnthropicContentBlock::ToolUse { id, name, .. } = v.content_block {
                            return Some((
                                Ok(StreamChunk::ToolCallStart { id, name }),
                                (sse, state),
                            ));
                        }
                    }
                }
                "content_block_delta" => {
                    let v: AnthropicContentBlockDelta = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::StreamParse(format!(
                                    "anthropic delta json error={e} data={data}"
                                ))),
                                (sse, state),
                            ));
                        }
                    };
                    let chunk = match v.delta {
                        AnthropicDelta::TextDelta { text } if !text.is_empty() => {
                            StreamChunk::Delta { content: text }
                        }
                        AnthropicDelta::InputJsonDelta { partial_json }
                            if !partial_json.is_empty() =>
                        {
                            StreamChunk::ToolCallDelta {
                                arguments: partial_json,
                            }
                        }
                        AnthropicDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                            StreamChunk::ReasoningDelta { content: thinking }
                        }
                        AnthropicDelta::SignatureDelta { signature } => {
                            StreamChunk::ReasoningSignature { signature }
                        }
                        _ => continue,
                    };
                    return Some((Ok(chunk), (sse, state)));
                }
                "message_delta" => {
                    if let Ok(v) = serde_json::from_str::<AnthropicMessageDelta>(&data) {
                        if let Some(u) = v.usage {
                            state.usage.completion_tokens = u.output_tokens as u32;
                        }
                        if let Some(reason) = v.delta.and_then(|d| d.stop_reason) {
                            state.finish_reason = reason;
                        }
                    }
                }
                "message_stop" => {
                    let usage = state.usage.clone();
                    let finish_reason = state.finish_reason.clone();
                    return Some((
                        Ok(StreamChunk::Done {
                            usage,
                            finish_reason,
                        }),
                        (sse, state),
                    ));
                }
                "error" => {
                    return Some((
                        Err(LlmError::Stream {
                            provider: "anthropic",
                            message: data.to_string(),
                        }),
                        (sse, state),
                    ));
                }
                _ => {}
            }
        }
    })
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<AnthropicThinking>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicThinking {
    r#type: String,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    r#type: String,
    disable_parallel_tool_use: bool,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition], stream: bool) -> Self {
        let mut system = String::new();
        let mut out_messages: Vec<AnthropicMessage> = Vec::new();

        for m in messages {
            let next = match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                    continue;
                }
                Role::User => to_anthropic_user_message(m),
                Role::Assistant => to_anthropic_assistant_message(m),
                Role::Tool => to_anthropic_tool_result_message(m),
            };
            // Consecutive tool results must share one user turn.
            match out_messages.last_mut() {
                Some(prev) if prev.role == next.role && next.role == "user" => {
                    prev.content.extend(next.content)
                }
                _ => out_messages.push(next),
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system,
            messages: out_messages,
            tools: tools.iter().map(to_anthropic_tool).collect(),
            tool_choice: None,
            thinking: None,
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    #[serde(other, skip_serializing)]
    Unsupported,
}

fn to_anthropic_user_message(m: &ChatMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: "user".to_string(),
        content: vec![AnthropicContentBlock::Text {
            text: m.content.clone(),
        }],
    }
}

fn to_anthropic_tool_result_message(m: &ChatMessage) -> AnthropicMessage {
    let tool_use_id = m.tool_call_id.clone().unwrap_or_default();
    AnthropicMessage {
        role: "user".to_string(),
        content: vec![AnthropicContentBlock::ToolResult {
            tool_use_id,
            content: m.content.clone(),
        }],
    }
}

fn to_anthropic_assistant_message(m: &ChatMessage) -> AnthropicMessage {
    let mut blocks = Vec::new();
    if let Some(Reasoning {
        text,
        signature: Some(signature),
    }) = m.reasoning.as_ref()
    {
        blocks.push(AnthropicContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        });
    }
    if !m.content.trim().is_empty() {
        blocks.push(AnthropicContentBlock::Text {
            text: m.content.clone(),
        });
    }
    for tc in &m.tool_calls {
        let input: serde_json::Value = match serde_json::from_str(&tc.arguments) {
            Ok(v) => v,
            Err(_) => serde_json::json!({}),
        };
        blocks.push(AnthropicContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input,
        });
    }
    AnthropicMessage {
        role: "assistant".to_string(),
        content: blocks,
    }
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        Usage {
            prompt_tokens: (u.input_tokens + u.cache_creation_input_tokens + u.cache_read_input_tokens)
                as u32,
            completion_tokens: u.output_tokens as u32,
            cache_read_tokens: u.cache_read_input_tokens as u32,
            cache_write_tokens: u.cache_creation_input_tokens as u32,
            reasoning_tokens: 0,
        }
    }
}

type SseItem = (String, String);

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseItem>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some((event, data)) = take_sse_event(&mut buffer) {
                    return Some((Ok((event, data)), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Pops the next complete `event:`/`data:` frame off the buffer.
fn take_sse_event(buffer: &mut String) -> Option<SseItem> {
    loop {
        let normalized = buffer.replace("\r\n", "\n");
        if normalized.len() != buffer.len() {
            *buffer = normalized;
        }
        let idx = buffer.find("\n\n")?;
        let raw = buffer[..idx].to_string();
        buffer.drain(..idx + 2);

        let mut event = String::new();
        let mut data_lines = Vec::new();
        for line in raw.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim_start().to_string();
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }

        let data = data_lines.join("\n");
        if event.is_empty() && data.is_empty() {
            continue;
        }
        if event.is_empty() {
            event = "message".to_string();
        }
        return Some((event, data));
    }
}

#[derive(Debug, Default)]
struct AnthropicStreamState {
    usage: Usage,
    finish_reason: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    message: AnthropicMessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStartMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockStart {
    content_block: AnthropicContentBlock,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockDelta {
    delta: AnthropicDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    SignatureDelta {
        signature: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    delta: Option<AnthropicMessageDeltaBody>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}
