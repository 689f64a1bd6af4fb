use crate::chart::DisplayChartTool;
use crate::error::{Result, ToolError};
use crate::grep::GrepTool;
use crate::list::ListTool;
use crate::read::ReadTool;
use crate::search::SearchTool;
use crate::sql::ExecuteSqlTool;
use crate::traits::{Tool, ToolContext, ToolSpec};
use async_trait::async_trait;
use std::sync::Arc;

/// Tools discovered outside the process (MCP servers).
#[async_trait]
pub trait ExternalTools: Send + Sync {
    /// Snapshot of the currently published external tools.
    async fn specs(&self) -> Vec<ToolSpec>;
    async fn contains(&self, name: &str) -> bool;
    async fn call(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

pub fn builtin_tools(http: reqwest::Client, sql_service_url: &str) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadTool),
        Arc::new(ListTool),
        Arc::new(SearchTool),
        Arc::new(GrepTool),
        Arc::new(ExecuteSqlTool::new(http, sql_service_url)),
        Arc::new(DisplayChartTool),
    ]
}

/// Local tools plus the external snapshot; an external tool shadows a local one with the same name.
#[derive(Clone)]
pub struct ToolCatalog {
    local: Vec<Arc<dyn Tool>>,
    external: Option<Arc<dyn ExternalTools>>,
}

impl ToolCatalog {
    pub fn new(local: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            local,
            external: None,
        }
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalTools>) -> Self {
        self.external = Some(external);
        self
    }

    pub async fn definitions(&self) -> Vec<ToolSpec> {
        let mut out: Vec<ToolSpec> = self.local.iter().map(|t| t.spec()).collect();
        let Some(external) = self.external.as_ref() else {
            return out;
        };
        for spec in external.specs().await {
            match out.iter_mut().find(|s| s.name == spec.name) {
                Some(slot) => *slot = spec,
                None => out.push(spec),
            }
        }
        out
    }

    pub async fn llm_definitions(&self) -> Vec<nao_llm::ToolDefinition> {
        self.definitions()
            .await
            .iter()
            .map(crate::traits::to_llm_tool_def)
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, arguments, ctx))]
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        if let Some(external) = self.external.as_ref() {
            if external.contains(name).await {
                return external.call(name, arguments).await;
            }
        }
        match self.local.iter().find(|t| t.spec().name == name) {
            Some(tool) => tool.execute(ctx, arguments).await,
            None => Err(ToolError::NotFound(name.to_string())),
        }
    }
}
