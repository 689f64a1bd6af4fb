use crate::catalog::McpToolInfo;
use crate::config::McpServerConfig;
use crate::connection::{McpConnection, McpConnector};
use crate::error::{McpError, Result};
use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::service::{Peer, RoleClient, RunningService, ServiceError};
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Connects over stdio child processes or streamable HTTP using rmcp.
pub struct RmcpConnector {
    connect_timeout: Duration,
}

impl RmcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn handshake_result<E: std::fmt::Display>(
    server: &str,
    timeout: Duration,
    outcome: std::result::Result<
        std::result::Result<RunningService<RoleClient, ()>, E>,
        tokio::time::error::Elapsed,
    >,
) -> Result<RunningService<RoleClient, ()>> {
    let timeout_secs = timeout.as_secs();
    outcome
        .map_err(|_| McpError::Connect {
            server: server.to_string(),
            message: format!("handshake timed out after {timeout_secs}s"),
        })?
        .map_err(|e| McpError::Connect {
            server: server.to_string(),
            message: format!("handshake failed: {e}"),
        })
}

#[async_trait]
impl McpConnector for RmcpConnector {
    #[tracing::instrument(level = "info", skip(self, config))]
    async fn connect(
        &self,
        server: &str,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpConnection>> {
        let service = match config {
            McpServerConfig::Stdio { command, args, env } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                cmd.envs(env);
                let transport = TokioChildProcess::new(cmd).map_err(|e| McpError::Connect {
                    server: server.to_string(),
                    message: format!("failed to spawn '{command}': {e}"),
                })?;
                let outcome =
                    tokio::time::timeout(self.connect_timeout, ().serve(transport)).await;
                handshake_result(server, self.connect_timeout, outcome)?
            }
            McpServerConfig::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.clone());
                let outcome =
                    tokio::time::timeout(self.connect_timeout, ().serve(transport)).await;
                handshake_result(server, self.connect_timeout, outcome)?
            }
        };

        tracing::info!(server = %server, "mcp server connected");
        let peer = service.peer().clone();
        Ok(Arc::new(RmcpConnection {
            server: server.to_string(),
            peer,
            service: Mutex::new(Some(service)),
        }))
    }
}

struct RmcpConnection {
    server: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

fn map_service_error(e: ServiceError) -> McpError {
    match e {
        ServiceError::McpError(data) => McpError::ToolFailed(data.message.to_string()),
        other => McpError::Transport(other.to_string()),
    }
}

#[async_trait]
impl McpConnection for RmcpConnection {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let tools = self.peer.list_all_tools().await.map_err(map_service_error)?;
        Ok(tools
            .into_iter()
            .map(|t| McpToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: serde_json::to_value(&*t.input_schema).unwrap_or_default(),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            other => {
                return Err(McpError::ToolFailed(format!(
                    "arguments for {name} must be an object, got {other}"
                )));
            }
        };
        let params = rmcp::model::CallToolRequestParams {
            meta: None,
            task: None,
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        let result = self.peer.call_tool(params).await.map_err(map_service_error)?;
        serde_json::to_value(&result).map_err(|e| McpError::ToolFailed(e.to_string()))
    }

    async fn close(&self) {
        let Some(service) = self.service.lock().await.take() else {
            return;
        };
        if let Err(e) = service.cancel().await {
            tracing::warn!(server = %self.server, error = %e, "error closing mcp server");
        }
    }
}
