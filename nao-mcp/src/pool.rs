use crate::catalog::{McpCatalog, ServerState};
use crate::config::ServerConfigs;
use crate::connection::{McpConnection, McpConnector};
use crate::error::{McpError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct PoolEntry {
    conn: Arc<dyn McpConnection>,
    created_at: Instant,
    last_used_at: Instant,
}

/// Named MCP connections with lazy connect and idle eviction.
///
/// Lock order: `entries` is never held across a connector or connection await.
pub struct McpPool {
    connector: Arc<dyn McpConnector>,
    configs: RwLock<ServerConfigs>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    failures: Mutex<HashMap<String, String>>,
    catalog: RwLock<Arc<McpCatalog>>,
}

impl McpPool {
    pub fn new(connector: Arc<dyn McpConnector>) -> Self {
        Self {
            connector,
            configs: RwLock::new(ServerConfigs::new()),
            entries: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            catalog: RwLock::new(Arc::new(McpCatalog::default())),
        }
    }

    /// Replaces the configuration and connects every server.
    ///
    /// Returns server name -> failure reason for the servers that did not connect.
    #[tracing::instrument(level = "info", skip_all, fields(servers = configs.len()))]
    pub async fn connect_all(&self, configs: ServerConfigs) -> HashMap<String, String> {
        *self.configs.write().await = configs.clone();

        let attempts = configs.iter().map(|(name, config)| async move {
            let outcome = self.connector.connect(name, config).await;
            (name.clone(), outcome)
        });
        let results = futures_util::future::join_all(attempts).await;

        let mut failures = HashMap::new();
        for (name, outcome) in results {
            match outcome {
                Ok(conn) => self.replace(&name, conn).await,
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "mcp server failed to connect");
                    failures.insert(name, e.to_string());
                }
            }
        }
        self.prune_unconfigured(&configs).await;
        *self.failures.lock().await = failures.clone();
        failures
    }

    /// Installs a connection built from the current config, closing any
    /// connection an on-demand call opened meanwhile.
    async fn replace(&self, server: &str, conn: Arc<dyn McpConnection>) {
        let now = Instant::now();
        let previous = self.entries.lock().await.insert(
            server.to_string(),
            PoolEntry {
                conn,
                created_at: now,
                last_used_at: now,
            },
        );
        if let Some(previous) = previous {
            previous.conn.close().await;
        }
    }

    /// Drops connections to servers the config no longer names.
    async fn prune_unconfigured(&self, configs: &ServerConfigs) {
        let stale: Vec<(String, PoolEntry)> = {
            let mut entries = self.entries.lock().await;
            let names: Vec<String> = entries
                .keys()
                .filter(|name| !configs.contains_key(*name))
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|name| entries.remove(&name).map(|e| (name, e)))
                .collect()
        };
        for (name, entry) in stale {
            tracing::info!(server = %name, "closing connection to removed mcp server");
            entry.conn.close().await;
        }
    }

    /// Lists tools from every warm connection and assembles a new catalog.
    ///
    /// The result is not published; see [`McpPool::publish`].
    pub async fn list_tools(&self) -> McpCatalog {
        let configured: Vec<String> = self.configs.read().await.keys().cloned().collect();
        let warm: Vec<(String, Arc<dyn McpConnection>)> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.conn.clone()))
            .collect();
        let failures = self.failures.lock().await.clone();

        let listings = futures_util::future::join_all(warm.into_iter().map(
            |(name, conn)| async move {
                let listed = conn.list_tools().await;
                (name, listed)
            },
        ))
        .await;
        let mut listed: HashMap<String, Result<_>> = listings.into_iter().collect();

        let mut servers = BTreeMap::new();
        for name in configured {
            let state = match listed.remove(&name) {
                Some(Ok(tools)) => ServerState { tools, error: None },
                Some(Err(e)) => {
                    tracing::warn!(server = %name, error = %e, "mcp server failed to list tools");
                    ServerState {
                        tools: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
                None => ServerState {
                    tools: Vec::new(),
                    error: failures.get(&name).cloned(),
                },
            };
            servers.insert(name, state);
        }
        McpCatalog::build(servers)
    }

    pub async fn publish(&self, catalog: McpCatalog) {
        *self.catalog.write().await = Arc::new(catalog);
    }

    pub async fn catalog(&self) -> Arc<McpCatalog> {
        self.catalog.read().await.clone()
    }

    /// Routes a tool call to its owning server via the published catalog.
    #[tracing::instrument(level = "info", skip(self, arguments))]
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let server = {
            let catalog = self.catalog.read().await;
            catalog
                .server_for(tool)
                .map(str::to_string)
                .ok_or_else(|| McpError::ToolNotFound(tool.to_string()))?
        };
        self.call_server_tool(&server, tool, arguments).await
    }

    /// Calls `tool` on `server`, reconnecting once if the connection turns out to be dead.
    pub async fn call_server_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let conn = self.get_or_connect(server).await?;
        match conn.call_tool(tool, arguments.clone()).await {
            Err(e) if e.is_transport() => {
                tracing::warn!(server = %server, error = %e, "mcp connection lost; reconnecting");
                self.evict(server, &conn).await;
                conn.close().await;
                let fresh = self.get_or_connect(server).await?;
                fresh.call_tool(tool, arguments).await
            }
            other => other,
        }
    }

    async fn get_or_connect(&self, server: &str) -> Result<Arc<dyn McpConnection>> {
        if let Some(entry) = self.entries.lock().await.get_mut(server) {
            entry.last_used_at = Instant::now();
            return Ok(entry.conn.clone());
        }

        let config = self
            .configs
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::Config(format!("server '{server}' is not configured")))?;
        let conn = self.connector.connect(server, &config).await?;
        // A sweep may have dropped the server while this connect was in flight.
        if !self.configs.read().await.contains_key(server) {
            conn.close().await;
            return Err(McpError::Config(format!(
                "server '{server}' is not configured"
            )));
        }
        Ok(self.insert_or_discard(server, conn).await)
    }

    /// Inserts `conn` unless another task won the race, in which case the
    /// existing connection is kept and `conn` is closed.
    async fn insert_or_discard(
        &self,
        server: &str,
        conn: Arc<dyn McpConnection>,
    ) -> Arc<dyn McpConnection> {
        let existing = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            match entries.get_mut(server) {
                Some(entry) => {
                    entry.last_used_at = now;
                    Some(entry.conn.clone())
                }
                None => {
                    entries.insert(
                        server.to_string(),
                        PoolEntry {
                            conn: conn.clone(),
                            created_at: now,
                            last_used_at: now,
                        },
                    );
                    None
                }
            }
        };
        match existing {
            Some(winner) => {
                conn.close().await;
                winner
            }
            None => conn,
        }
    }

    async fn evict(&self, server: &str, conn: &Arc<dyn McpConnection>) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(server)
            .is_some_and(|e| Arc::ptr_eq(&e.conn, conn))
        {
            entries.remove(server);
        }
    }

    /// Closes every connection idle for longer than `ttl`. Returns how many were closed.
    pub async fn reap(&self, ttl: Duration) -> usize {
        let expired: Vec<(String, PoolEntry)> = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used_at) > ttl)
                .map(|(name, _)| name.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|name| entries.remove(&name).map(|e| (name, e)))
                .collect()
        };

        for (name, entry) in &expired {
            tracing::info!(
                server = %name,
                age_secs = entry.created_at.elapsed().as_secs(),
                "closing idle mcp connection"
            );
            entry.conn.close().await;
        }
        expired.len()
    }

    pub fn start_reaper(
        self: &Arc<Self>,
        every: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = pool.reap(ttl).await;
                        if closed > 0 {
                            tracing::debug!(closed, "mcp reaper tick");
                        }
                    }
                }
            }
        })
    }

    /// Closes every connection and forgets recorded failures.
    pub async fn close_all(&self) {
        let drained: Vec<(String, PoolEntry)> = self.entries.lock().await.drain().collect();
        for (name, entry) in drained {
            tracing::debug!(server = %name, "closing mcp connection");
            entry.conn.close().await;
        }
        self.failures.lock().await.clear();
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, configs};
    use super::*;
    use std::sync::atomic::Ordering;

    const TTL: Duration = Duration::from_secs(300);

    fn pool() -> (Arc<FakeConnector>, Arc<McpPool>) {
        let connector = Arc::new(FakeConnector::default());
        let pool = Arc::new(McpPool::new(connector.clone()));
        (connector, pool)
    }

    #[tokio::test]
    async fn one_bad_server_does_not_block_the_rest() {
        let (_, pool) = pool();
        let failures = pool.connect_all(configs(&["alpha", "bad_one", "mute"])).await;
        assert_eq!(failures.len(), 1);
        assert!(failures["bad_one"].contains("spawn failed"));

        let catalog = pool.list_tools().await;
        assert_eq!(catalog.server_for("alpha_tool"), Some("alpha"));
        assert_eq!(catalog.server_for("mute_tool"), None);
        assert_eq!(catalog.server_for("common"), Some("alpha"));
        assert!(catalog.servers()["bad_one"].error.is_some());
        assert!(catalog.servers()["mute"].error.is_some());
        assert!(catalog.servers()["alpha"].error.is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_by_name() {
        let (_, pool) = pool();
        pool.connect_all(configs(&["alpha"])).await;
        let catalog = pool.list_tools().await;
        pool.publish(catalog).await;

        let err = pool
            .call_tool("missing", serde_json::json!({}))
            .await
            .expect_err("not found");
        assert_eq!(err.to_string(), "Tool missing not found in any server");

        let out = pool
            .call_tool("alpha_tool", serde_json::json!({"q": 1}))
            .await
            .expect("call");
        assert_eq!(out["tool"], "alpha_tool");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_reaped_after_ttl() {
        let (connector, pool) = pool();
        pool.connect_all(configs(&["alpha", "beta"])).await;

        tokio::time::advance(Duration::from_secs(240)).await;
        pool.call_server_tool("alpha", "alpha_tool", serde_json::json!({}))
            .await
            .expect("call");
        assert_eq!(pool.reap(TTL).await, 0);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(pool.reap(TTL).await, 1);
        assert_eq!(pool.connected_servers().await, vec!["alpha".to_string()]);

        let made = connector.made.lock().expect("made").clone();
        let beta = made
            .iter()
            .find(|c| c.tools[0].name == "beta_tool")
            .expect("beta");
        assert!(beta.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn reaped_server_reconnects_on_demand() {
        let (connector, pool) = pool();
        pool.connect_all(configs(&["alpha"])).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.reap(TTL).await, 1);

        pool.call_server_tool("alpha", "alpha_tool", serde_json::json!({}))
            .await
            .expect("lazy reconnect");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_stops_on_shutdown() {
        let (_, pool) = pool();
        pool.connect_all(configs(&["alpha"])).await;
        let shutdown = CancellationToken::new();
        let handle = pool.start_reaper(Duration::from_secs(30), TTL, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(331)).await;
        assert!(pool.connected_servers().await.is_empty());

        shutdown.cancel();
        handle.await.expect("reaper join");
    }

    #[tokio::test]
    async fn transport_failure_triggers_one_reconnect() {
        let (connector, pool) = pool();
        pool.connect_all(configs(&["flaky"])).await;

        // Fresh connections from the fake are flaky too, so the retry fails once more.
        let out = pool
            .call_server_tool("flaky", "flaky_tool", serde_json::json!({}))
            .await;
        assert!(matches!(out, Err(McpError::Transport(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        let out = pool
            .call_server_tool("flaky", "flaky_tool", serde_json::json!({}))
            .await
            .expect("second connection now healthy");
        assert_eq!(out["tool"], "flaky_tool");
    }

    #[tokio::test]
    async fn reconfigure_drops_connections_to_removed_servers() {
        let (connector, pool) = pool();
        pool.connect_all(configs(&["alpha", "beta"])).await;

        // An on-demand reconnect races the sweep and leaves an old beta entry behind.
        pool.close_all().await;
        pool.call_server_tool("beta", "beta_tool", serde_json::json!({}))
            .await
            .expect("on-demand connect");
        pool.call_server_tool("alpha", "alpha_tool", serde_json::json!({}))
            .await
            .expect("on-demand connect");

        pool.connect_all(configs(&["alpha"])).await;
        assert_eq!(pool.connected_servers().await, vec!["alpha".to_string()]);

        let made = connector.made.lock().expect("made").clone();
        let open: Vec<&str> = made
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .map(|c| c.tools[0].description.as_str())
            .collect();
        assert_eq!(open, vec!["alpha"]);

        let err = pool
            .call_server_tool("beta", "beta_tool", serde_json::json!({}))
            .await
            .expect_err("beta removed");
        assert!(matches!(err, McpError::Config(_)));
    }

    #[tokio::test]
    async fn close_all_closes_everything() {
        let (connector, pool) = pool();
        pool.connect_all(configs(&["alpha", "beta"])).await;
        pool.close_all().await;
        assert!(pool.connected_servers().await.is_empty());
        let made = connector.made.lock().expect("made").clone();
        assert!(made.iter().all(|c| c.closed.load(Ordering::SeqCst)));
    }
}
