//! nao server.
//!
//! Wires the chat store, MCP service, tool catalog, model resolver and
//! session registry into one [`AppState`], then serves the HTTP routes.

use crate::agent::AgentRuntime;
use crate::backend::LlmBackendFactory;
use crate::config::NaoConfig;
use crate::registry::SessionRegistry;
use crate::resolver::{EnvCredentials, ModelResolver};
use crate::routes;
use crate::session::SessionEnv;
use crate::store::{ChatStore, MemoryChatStore, SqliteChatStore};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use nao_channels::{MessagingChannel, SlackClient};
use nao_llm::{Provider, validate_tool_name_all_providers};
use nao_mcp::{McpService, RmcpConnector};
use nao_tools::{ExternalTools, Tool, ToolCatalog, ToolContext, builtin_tools};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Slack bridge settings, present only when a bot token is configured.
#[derive(Clone)]
pub struct SlackState {
    pub channel: Arc<dyn MessagingChannel>,
    pub signing_secret: String,
    /// Web UI base; chat ids are appended to it.
    pub redirect_url: String,
}

impl SlackState {
    pub fn conversation_url(&self, chat_id: &str) -> String {
        format!("{}{chat_id}", self.redirect_url)
    }
}

pub struct AppState {
    pub runtime: Arc<AgentRuntime>,
    pub mcp: Arc<McpService>,
    pub slack: Option<SlackState>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        runtime: Arc<AgentRuntime>,
        mcp: Arc<McpService>,
        slack: Option<SlackState>,
    ) -> Self {
        Self {
            runtime,
            mcp,
            slack,
            started_at: Instant::now(),
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = NaoConfig::load_with_path(config_path).await?;
    let project_folder = cfg.project_folder()?;
    let credentials = env_credentials(&cfg);
    tracing::info!(
        config_path = %path.display(),
        project_folder = %project_folder.display(),
        project_folder_exists = project_folder.is_dir(),
        database_path = ?cfg.database_path()?,
        mcp_config_path = ?cfg.mcp.config_path,
        slack_enabled = cfg.slack.enabled(),
        sql_service_url = %cfg.sql.service_url,
        env_providers = ?credentials.configured(),
        "config ok"
    );
    if credentials.configured().is_empty() {
        tracing::warn!(
            "no provider keys in config or environment; chats need project-level keys"
        );
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = NaoConfig::load_with_path(config_path).await?;
    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {}: {e}", cfg.server.bind_addr))?;
    let project_folder = cfg.project_folder()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        project_folder = %project_folder.display(),
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        mcp_config_path = ?cfg.mcp.config_path,
        mcp_idle_ttl_seconds = cfg.mcp.idle_ttl_seconds,
        mcp_reap_interval_seconds = cfg.mcp.reap_interval_seconds,
        slack_enabled = cfg.slack.enabled(),
        agent_max_steps = cfg.agent.max_steps,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = open_store(&cfg)?;

    let mcp = McpService::new(
        Arc::new(RmcpConnector::new(Duration::from_secs(
            cfg.mcp.connect_timeout_seconds,
        ))),
        cfg.mcp.settings(),
    );
    mcp.init().await;

    // Tool calls carry no timeout of their own; session cancellation bounds them.
    let tools = builtin_tools(reqwest::Client::new(), &cfg.sql.service_url);
    preflight_validate_tool_names(&tools)?;
    let external: Arc<dyn ExternalTools> = mcp.clone();
    let catalog = Arc::new(ToolCatalog::new(tools).with_external(external));

    let env = Arc::new(SessionEnv {
        store: store.clone(),
        catalog,
        tool_ctx: ToolContext::new(&project_folder)?,
        system_prompt: cfg.agent.system_prompt.clone(),
        max_steps: cfg.agent.max_steps,
    });
    let credentials = env_credentials(&cfg);
    tracing::info!(env_providers = ?credentials.configured(), "model resolver initialized");
    let registry = Arc::new(SessionRegistry::new(
        ModelResolver::new(store.clone(), credentials),
        Arc::new(LlmBackendFactory),
        env,
    ));

    let shutdown = CancellationToken::new();
    let runtime = Arc::new(AgentRuntime::new(
        store,
        registry,
        cfg.project.default_project_id.clone(),
        shutdown.child_token(),
    ));

    let slack = if cfg.slack.enabled() {
        let channel: Arc<dyn MessagingChannel> = Arc::new(SlackClient::new(&cfg.slack.bot_token)?);
        Some(SlackState {
            channel,
            signing_secret: cfg.slack.signing_secret.clone(),
            redirect_url: cfg.slack.redirect_url.clone(),
        })
    } else {
        None
    };

    let state = Arc::new(AppState::new(runtime, mcp.clone(), slack));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.server.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "nao serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    // Running sessions observe this through their scope and persist as interrupted.
    shutdown.cancel();
    mcp.shutdown().await;
    tracing::info!("mcp pool shutdown completed");

    Ok(())
}

fn open_store(cfg: &NaoConfig) -> Result<Arc<dyn ChatStore>> {
    match cfg.database_path()? {
        Some(path) => {
            tracing::info!(database_path = %path.display(), "opening sqlite chat store");
            Ok(Arc::new(SqliteChatStore::open(&path)?))
        }
        None => {
            tracing::warn!("storage.database_path is empty; chats are kept in memory only");
            Ok(Arc::new(MemoryChatStore::new()))
        }
    }
}

fn env_credentials(cfg: &NaoConfig) -> EnvCredentials {
    Provider::ALL
        .into_iter()
        .fold(EnvCredentials::new(), |creds, provider| {
            creds.with_key(provider, cfg.keys.for_provider(provider))
        })
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn preflight_validate_tool_names(tools: &[Arc<dyn Tool>]) -> Result<()> {
    for tool in tools {
        let spec = tool.spec();
        validate_tool_name_all_providers(&spec.name).map_err(|e| {
            anyhow::anyhow!(
                "preflight tool name validation failed for '{}': {e}",
                spec.name
            )
        })?;
    }
    tracing::info!(
        tool_count = tools.len(),
        "preflight tool name validation passed"
    );
    Ok(())
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::agent::testing::{Harness, harness};
    use crate::session::testing::Script;
    use nao_mcp::McpSettings;

    pub(crate) struct TestApp {
        pub(crate) harness: Harness,
        pub(crate) state: Arc<AppState>,
    }

    pub(crate) fn test_app(scripts: Vec<Script>, slack: Option<SlackState>) -> TestApp {
        let harness = harness(scripts);
        let mcp = McpService::new(
            Arc::new(RmcpConnector::new(Duration::from_secs(1))),
            McpSettings::default(),
        );
        let state = Arc::new(AppState::new(harness.runtime.clone(), mcp, slack));
        TestApp { harness, state }
    }

    pub(crate) fn router(app: &TestApp) -> axum::Router {
        routes::router().layer(Extension(app.state.clone()))
    }
}
