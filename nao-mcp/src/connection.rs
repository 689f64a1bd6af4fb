use crate::catalog::McpToolInfo;
use crate::config::McpServerConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// One live session with an MCP server.
#[async_trait]
pub trait McpConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>>;
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value>;
    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, server: &str, config: &McpServerConfig)
    -> Result<Arc<dyn McpConnection>>;
}
