//! Model/provider resolution.
//!
//! Order: explicit selection with a project key, explicit selection with an
//! environment key, project keys by provider priority, environment keys by
//! provider priority. Anything else is a configuration error.

use crate::store::ChatStore;
use nao_llm::{LlmConfig, Provider};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelSelection {
    pub provider: Provider,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(
        "No LLM API key found. Configure API keys in project settings or set ANTHROPIC_API_KEY/OPENAI_API_KEY environment variables."
    )]
    NoCredentials,
    #[error(
        "No API key configured for {provider}. Configure it in project settings or set {env_var}."
    )]
    ProviderNotConfigured {
        provider: Provider,
        env_var: &'static str,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Process-wide keys, read once from config/environment.
#[derive(Clone, Default)]
pub struct EnvCredentials {
    keys: HashMap<Provider, String>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: Provider, key: Option<&str>) -> Self {
        if let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) {
            self.keys.insert(provider, key.to_string());
        }
        self
    }

    pub fn get(&self, provider: Provider) -> Option<&str> {
        self.keys.get(&provider).map(String::as_str)
    }

    pub fn configured(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.keys.contains_key(p))
            .collect()
    }
}

impl std::fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentials")
            .field("providers", &self.configured())
            .finish()
    }
}

pub struct ModelResolver {
    store: Arc<dyn ChatStore>,
    env: EnvCredentials,
}

impl ModelResolver {
    pub fn new(store: Arc<dyn ChatStore>, env: EnvCredentials) -> Self {
        Self { store, env }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(project_id = %project_id))]
    pub async fn resolve(
        &self,
        project_id: &str,
        explicit: Option<&ModelSelection>,
    ) -> Result<LlmConfig, ResolveError> {
        if let Some(selection) = explicit {
            let provider = selection.provider;
            if let Some(cred) = self.store.get_project_llm_config(project_id, provider).await? {
                tracing::debug!(provider = %provider, model = %selection.model, "using explicit selection with project key");
                return Ok(LlmConfig::new(provider, selection.model.clone(), cred.api_key)
                    .with_base_url(cred.base_url));
            }
            if let Some(key) = self.env.get(provider) {
                tracing::debug!(provider = %provider, model = %selection.model, "using explicit selection with environment key");
                return Ok(LlmConfig::new(provider, selection.model.clone(), key));
            }
            return Err(ResolveError::ProviderNotConfigured {
                provider,
                env_var: provider.env_key_var(),
            });
        }

        for provider in Provider::ALL {
            if let Some(cred) = self.store.get_project_llm_config(project_id, provider).await? {
                let model = cred
                    .enabled_models
                    .iter()
                    .find(|m| !m.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| provider.default_model().to_string());
                tracing::debug!(provider = %provider, model = %model, "using project key");
                return Ok(LlmConfig::new(provider, model, cred.api_key).with_base_url(cred.base_url));
            }
        }

        for provider in Provider::ALL {
            if let Some(key) = self.env.get(provider) {
                tracing::debug!(provider = %provider, "using environment key");
                return Ok(LlmConfig::new(provider, provider.default_model(), key));
            }
        }

        Err(ResolveError::NoCredentials)
    }
}
