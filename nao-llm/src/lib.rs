//! Streaming LLM clients for the nao agent runtime.
//!
//! Plain HTTP against the Anthropic Messages and OpenAI Chat Completions APIs.
//! The session loop only talks to [`ModelBackend`], so tests can script model
//! output without a network.

mod anthropic;
mod backend;
mod client;
mod error;
mod openai;
mod provider;
mod types;

pub use backend::{ChatStream, ModelBackend};
pub use client::{LlmClient, LlmConfig, validate_tool_name_all_providers};
pub use error::{LlmError, Result};
pub use provider::{Provider, ProviderOptions};
pub use types::{
    ChatMessage, Reasoning, Role, StreamChunk, ToolCall, ToolDefinition, Usage,
};
