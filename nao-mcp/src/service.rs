use crate::catalog::{McpCatalog, ServerState};
use crate::config::{ServerConfigs, load_config};
use crate::connection::McpConnector;
use crate::error::{McpError, Result};
use crate::pool::McpPool;
use crate::watcher::{debounce_loop, watch_file};
use async_trait::async_trait;
use nao_tools::{ExternalTools, ToolError, ToolSpec};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct McpSettings {
    pub config_path: Option<PathBuf>,
    pub debounce: Duration,
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            debounce: Duration::from_millis(2000),
            idle_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Process-wide owner of the MCP pool and its config lifecycle.
pub struct McpService {
    pool: Arc<McpPool>,
    settings: McpSettings,
    sweep_lock: Mutex<()>,
    initialized: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl McpService {
    pub fn new(connector: Arc<dyn McpConnector>, settings: McpSettings) -> Arc<Self> {
        Arc::new(Self {
            pool: Arc::new(McpPool::new(connector)),
            settings,
            sweep_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Initial sweep, then the reaper and the config watcher. Only the first call does anything.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn init(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.settings.config_path.as_ref() {
            Some(path) => {
                self.sweep().await;
                self.spawn_watcher(path.clone()).await;
            }
            None => tracing::info!("no MCP config path set; external tools disabled"),
        }

        let reaper = self.pool.start_reaper(
            self.settings.reap_interval,
            self.settings.idle_ttl,
            self.shutdown.clone(),
        );
        self.tasks.lock().await.push(reaper);
    }

    async fn spawn_watcher(self: &Arc<Self>, path: PathBuf) {
        let (watcher, events) = match watch_file(&path) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "mcp config hot reload disabled");
                return;
            }
        };
        let service = Arc::clone(self);
        let window = self.settings.debounce;
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            // Dropping the watcher stops event delivery.
            let _watcher = watcher;
            debounce_loop(events, window, shutdown, || {
                let service = service.clone();
                async move {
                    tracing::info!("mcp config changed; reconnecting");
                    service.sweep().await;
                }
            })
            .await;
        });
        self.tasks.lock().await.push(handle);
    }

    /// Full reconnect sweep on demand.
    pub async fn reload(&self) -> Result<()> {
        if self.settings.config_path.is_none() {
            return Err(McpError::Config("MCP config path is not set".to_string()));
        }
        self.sweep().await;
        Ok(())
    }

    /// closeAll, re-read config, connectAll, listTools, then publish.
    /// The previous catalog stays visible until the new one is complete.
    async fn sweep(&self) {
        let _guard = self.sweep_lock.lock().await;
        let configs = self.read_configs().await;

        self.pool.close_all().await;
        let failures = self.pool.connect_all(configs).await;
        let catalog = self.pool.list_tools().await;
        tracing::info!(
            servers = catalog.servers().len(),
            failed = failures.len(),
            tools = catalog.tools().len(),
            "mcp catalog rebuilt"
        );
        self.pool.publish(catalog).await;
    }

    async fn read_configs(&self) -> ServerConfigs {
        let Some(path) = self.settings.config_path.as_ref() else {
            return ServerConfigs::new();
        };
        match load_config(path).await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "mcp config unusable; treating as no servers");
                ServerConfigs::new()
            }
        }
    }

    pub async fn catalog(&self) -> Arc<McpCatalog> {
        self.pool.catalog().await
    }

    pub async fn state(&self) -> BTreeMap<String, ServerState> {
        self.pool.catalog().await.servers().clone()
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.pool.call_tool(tool, arguments).await
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "mcp background task ended abnormally");
            }
        }
        self.pool.close_all().await;
    }
}

#[async_trait]
impl ExternalTools for McpService {
    async fn specs(&self) -> Vec<ToolSpec> {
        self.catalog()
            .await
            .tools()
            .iter()
            .map(|t| ToolSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters_schema: t.input_schema.clone(),
            })
            .collect()
    }

    async fn contains(&self, name: &str) -> bool {
        self.catalog().await.server_for(name).is_some()
    }

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> nao_tools::Result<serde_json::Value> {
        self.call_tool(name, arguments)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::FakeConnector;
    use std::sync::atomic::Ordering;

    fn write_config(dir: &std::path::Path, servers: &[&str]) -> PathBuf {
        let entries: serde_json::Map<String, serde_json::Value> = servers
            .iter()
            .map(|s| (s.to_string(), serde_json::json!({"command": format!("{s}-server")})))
            .collect();
        let path = dir.join("mcp.json");
        std::fs::write(&path, serde_json::json!({"mcpServers": entries}).to_string())
            .expect("write config");
        path
    }

    fn settings(path: Option<PathBuf>) -> McpSettings {
        McpSettings {
            config_path: path,
            ..McpSettings::default()
        }
    }

    #[tokio::test]
    async fn init_is_idempotent_and_publishes_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), &["alpha", "bad_x"]);
        let connector = Arc::new(FakeConnector::default());
        let service = McpService::new(connector.clone(), settings(Some(path)));

        service.init().await;
        service.init().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        let state = service.state().await;
        assert_eq!(state["alpha"].tools.len(), 2);
        assert!(state["bad_x"].error.is_some());
        assert!(service.contains("alpha_tool").await);

        let out = service
            .call("alpha_tool", serde_json::json!({"x": 1}))
            .await
            .expect("call");
        assert_eq!(out["args"]["x"], 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn reload_without_path_is_a_config_error() {
        let service = McpService::new(Arc::new(FakeConnector::default()), settings(None));
        service.init().await;
        assert!(matches!(service.reload().await, Err(McpError::Config(_))));
        assert!(service.state().await.is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_config_means_no_servers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{ not json").expect("write");
        let service = McpService::new(Arc::new(FakeConnector::default()), settings(Some(path)));
        service.reload().await.expect("reload");
        assert!(service.state().await.is_empty());
    }

    #[tokio::test]
    async fn old_catalog_stays_visible_during_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), &["alpha"]);
        let gate = Arc::new(tokio::sync::Semaphore::new(1));
        let connector = Arc::new(FakeConnector {
            gate: Some(gate.clone()),
            ..FakeConnector::default()
        });
        let service = McpService::new(connector, settings(Some(path.clone())));
        service.reload().await.expect("first sweep");
        assert!(service.contains("alpha_tool").await);

        write_config(dir.path(), &["beta"]);
        let sweeping = {
            let service = service.clone();
            tokio::spawn(async move { service.reload().await })
        };
        // The connect for beta is parked on the gate; readers still see alpha.
        tokio::task::yield_now().await;
        for _ in 0..10 {
            let catalog = service.catalog().await;
            assert!(!catalog.is_empty());
            assert_eq!(catalog.server_for("alpha_tool"), Some("alpha"));
            tokio::task::yield_now().await;
        }

        gate.add_permits(1);
        sweeping.await.expect("join").expect("second sweep");
        let catalog = service.catalog().await;
        assert_eq!(catalog.server_for("beta_tool"), Some("beta"));
        assert_eq!(catalog.server_for("alpha_tool"), None);
    }
}
