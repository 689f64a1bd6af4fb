use crate::error::LlmError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ANTHROPIC_MODELS: &[&str] = &[
    "claude-opus-4-5",
    "claude-sonnet-4-5",
    "claude-3-5-sonnet-latest",
    "claude-3-5-haiku-latest",
    "claude-3-opus-latest",
];

const OPENAI_MODELS: &[&str] = &[
    "gpt-5.1",
    "gpt-5",
    "gpt-4.1",
    "gpt-4.1-mini",
    "o3",
    "o3-mini",
    "gpt-4o",
    "gpt-4o-mini",
];

const ANTHROPIC_THINKING_BUDGET_TOKENS: u32 = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
}

impl Provider {
    /// Fallback priority: earlier providers win when several are configured.
    pub const ALL: [Provider; 2] = [Provider::Anthropic, Provider::OpenAI];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAI => "openai",
        }
    }

    pub fn known_models(&self) -> &'static [&'static str] {
        match self {
            Provider::Anthropic => ANTHROPIC_MODELS,
            Provider::OpenAI => OPENAI_MODELS,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-opus-4-5",
            Provider::OpenAI => "gpt-5.1",
        }
    }

    /// Environment variable holding the process-wide key for this provider.
    pub fn env_key_var(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::OpenAI => "OPENAI_API_KEY",
        }
    }

    pub fn options(&self) -> ProviderOptions {
        match self {
            Provider::Anthropic => ProviderOptions {
                thinking_budget_tokens: Some(ANTHROPIC_THINKING_BUDGET_TOKENS),
                parallel_tool_use: true,
            },
            Provider::OpenAI => ProviderOptions {
                thinking_budget_tokens: None,
                parallel_tool_use: true,
            },
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAI),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }
}

/// Per-provider request options. Fixed per provider, not user-configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// Extended thinking budget; `None` disables thinking.
    pub thinking_budget_tokens: Option<u32>,
    pub parallel_tool_use: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_first_known_model() {
        for provider in Provider::ALL {
            assert_eq!(provider.known_models()[0], provider.default_model());
        }
    }

    #[test]
    fn parses_provider_names_case_insensitively() {
        assert_eq!("OpenAI".parse::<Provider>().expect("parse"), Provider::OpenAI);
        assert_eq!(" anthropic ".parse::<Provider>().expect("parse"), Provider::Anthropic);
        assert!("mistral".parse::<Provider>().is_err());
    }

    #[test]
    fn anthropic_enables_thinking_with_parallel_tools() {
        let options = Provider::Anthropic.options();
        assert_eq!(options.thinking_budget_tokens, Some(12_000));
        assert!(options.parallel_tool_use);
        assert_eq!(Provider::OpenAI.options().thinking_budget_tokens, None);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Provider::OpenAI).expect("serialize");
        assert_eq!(json, "\"openai\"");
    }
}
