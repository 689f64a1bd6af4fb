use nao_llm::{LlmClient, LlmConfig, ModelBackend};
use std::sync::Arc;

/// Turns a resolved model configuration into something that can stream.
pub trait BackendFactory: Send + Sync {
    fn build(&self, config: &LlmConfig) -> anyhow::Result<Arc<dyn ModelBackend>>;
}

/// Real provider HTTP clients.
pub struct LlmBackendFactory;

impl BackendFactory for LlmBackendFactory {
    fn build(&self, config: &LlmConfig) -> anyhow::Result<Arc<dyn ModelBackend>> {
        Ok(Arc::new(LlmClient::new(config.clone())?))
    }
}
