//! nao configuration loader.
//!
//! TOML on disk, then environment overrides, then validation.

use nao_llm::Provider;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NaoConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5005".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Project folder exposed to the file tools as `/`. Defaults to the working directory.
    #[serde(default)]
    pub default_path: Option<String>,
    #[serde(default = "default_project_id")]
    pub default_project_id: String,
}

fn default_project_id() -> String {
    "default".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            default_path: None,
            default_project_id: default_project_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite file. Empty keeps everything in memory.
    #[serde(default)]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default = "default_mcp_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_mcp_idle_ttl_seconds")]
    pub idle_ttl_seconds: u64,
    #[serde(default = "default_mcp_reap_interval_seconds")]
    pub reap_interval_seconds: u64,
    #[serde(default = "default_mcp_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

fn default_mcp_debounce_ms() -> u64 {
    2000
}

fn default_mcp_idle_ttl_seconds() -> u64 {
    300
}

fn default_mcp_reap_interval_seconds() -> u64 {
    30
}

fn default_mcp_connect_timeout_seconds() -> u64 {
    30
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            debounce_ms: default_mcp_debounce_ms(),
            idle_ttl_seconds: default_mcp_idle_ttl_seconds(),
            reap_interval_seconds: default_mcp_reap_interval_seconds(),
            connect_timeout_seconds: default_mcp_connect_timeout_seconds(),
        }
    }
}

impl McpConfig {
    pub fn settings(&self) -> nao_mcp::McpSettings {
        nao_mcp::McpSettings {
            config_path: self.config_path.as_deref().map(PathBuf::from),
            debounce: Duration::from_millis(self.debounce_ms),
            idle_ttl: Duration::from_secs(self.idle_ttl_seconds),
            reap_interval: Duration::from_secs(self.reap_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub signing_secret: String,
    /// Base URL of the web UI; chat ids are appended to it.
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
}

fn default_redirect_url() -> String {
    "http://localhost:3000/".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            signing_secret: String::new(),
            redirect_url: default_redirect_url(),
        }
    }
}

impl SlackConfig {
    pub fn enabled(&self) -> bool {
        !self.bot_token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlConfig {
    #[serde(default = "default_sql_service_url")]
    pub service_url: String,
}

fn default_sql_service_url() -> String {
    let port = std::env::var("FASTAPI_PORT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "8005".to_string());
    format!("http://127.0.0.1:{port}")
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            service_url: default_sql_service_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_steps() -> usize {
    20
}

fn default_system_prompt() -> String {
    "You are nao, a data analyst agent. The project folder holds database context \
     and documentation; explore it with the file tools before writing SQL. \
     Use execute_sql to answer data questions and display_chart to visualize results."
        .to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

impl KeysConfig {
    pub fn for_provider(&self, provider: Provider) -> Option<&str> {
        let key = match provider {
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
            Provider::OpenAI => self.openai_api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

impl NaoConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    /// An explicit path must exist; the default path may be absent.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.or_else(|| {
            std::env::var("NAO_CONFIG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });
        let (path, required) = match explicit {
            Some(p) => (p, true),
            None => (default_config_path(), false),
        };

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "config file not found, using defaults");
                NaoConfig::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("NAO_DEFAULT_PROJECT_PATH") {
            self.project.default_path = Some(v);
        }
        if let Some(v) = var("MCP_JSON_FILE_PATH") {
            self.mcp.config_path = Some(v);
        }
        if let Some(v) = var("SLACK_BOT_TOKEN") {
            self.slack.bot_token = v;
        }
        if let Some(v) = var("SLACK_SIGNING_SECRET") {
            self.slack.signing_secret = v;
        }
        if let Some(v) = var("REDIRECT_URL") {
            self.slack.redirect_url = v;
        }
        if let Some(v) = var("FASTAPI_URL") {
            self.sql.service_url = v;
        } else if let Some(port) = var("FASTAPI_PORT") {
            self.sql.service_url = format!("http://127.0.0.1:{port}");
        }
        if let Some(v) = var("NAO_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = var("NAO_DATABASE_PATH") {
            self.storage.database_path = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.mcp.debounce_ms == 0 {
            return Err(anyhow::anyhow!("mcp.debounce_ms must be > 0"));
        }
        if self.mcp.idle_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("mcp.idle_ttl_seconds must be > 0"));
        }
        if self.mcp.reap_interval_seconds == 0 {
            return Err(anyhow::anyhow!("mcp.reap_interval_seconds must be > 0"));
        }
        if self.mcp.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("mcp.connect_timeout_seconds must be > 0"));
        }
        if self.agent.max_steps == 0 {
            return Err(anyhow::anyhow!("agent.max_steps must be > 0"));
        }
        if self.slack.enabled() && self.slack.signing_secret.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "slack.signing_secret is required when slack.bot_token is set"
            ));
        }
        Ok(())
    }

    pub fn project_folder(&self) -> anyhow::Result<PathBuf> {
        match self.project.default_path.as_deref() {
            Some(p) if !p.trim().is_empty() => expand_home(p),
            _ => Ok(std::env::current_dir()?),
        }
    }

    pub fn database_path(&self) -> anyhow::Result<Option<PathBuf>> {
        let raw = self.storage.database_path.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        expand_home(raw).map(Some)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".nao").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = NaoConfig::parse("").expect("parse");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:5005");
        assert_eq!(cfg.server.http_max_in_flight, 256);
        assert_eq!(cfg.mcp.debounce_ms, 2000);
        assert_eq!(cfg.mcp.idle_ttl_seconds, 300);
        assert_eq!(cfg.mcp.reap_interval_seconds, 30);
        assert_eq!(cfg.agent.max_steps, 20);
        assert_eq!(cfg.slack.redirect_url, "http://localhost:3000/");
        assert_eq!(cfg.project.default_project_id, "default");
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn env_overrides_win_when_non_empty() {
        let mut cfg = NaoConfig::parse(
            r#"
            [keys]
            anthropic_api_key = "from-file"
            [slack]
            redirect_url = "https://file.example/"
            "#,
        )
        .expect("parse");
        let env: HashMap<&str, &str> = HashMap::from([
            ("ANTHROPIC_API_KEY", "from-env"),
            ("REDIRECT_URL", "   "),
            ("MCP_JSON_FILE_PATH", "/tmp/mcp.json"),
            ("FASTAPI_PORT", "9000"),
        ]);
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.keys.for_provider(Provider::Anthropic), Some("from-env"));
        assert_eq!(cfg.slack.redirect_url, "https://file.example/");
        assert_eq!(cfg.mcp.config_path.as_deref(), Some("/tmp/mcp.json"));
        assert_eq!(cfg.sql.service_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn validate_rejects_zero_limits_and_unsigned_slack() {
        let cfg = NaoConfig::parse("[server]\nhttp_max_in_flight = 0").expect("parse");
        assert!(cfg.validate().is_err());

        let cfg = NaoConfig::parse("[mcp]\nidle_ttl_seconds = 0").expect("parse");
        assert!(cfg.validate().is_err());

        let cfg = NaoConfig::parse("[slack]\nbot_token = \"xoxb-1\"").expect("parse");
        let err = cfg.validate().expect_err("missing signing secret");
        assert!(err.to_string().contains("signing_secret"));
    }

    #[tokio::test]
    async fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert!(NaoConfig::load(Some(missing)).await.is_err());
    }

    #[tokio::test]
    async fn loads_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nmax_steps = 5\n").expect("write");
        let (cfg, loaded_from) = NaoConfig::load_with_path(Some(path.clone()))
            .await
            .expect("load");
        assert_eq!(cfg.agent.max_steps, 5);
        assert_eq!(loaded_from, path);
    }
}
