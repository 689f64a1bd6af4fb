use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let servers = state.mcp.state().await;
    let failing: Vec<&String> = servers
        .iter()
        .filter(|(_, s)| s.error.is_some())
        .map(|(name, _)| name)
        .collect();
    let tool_count: usize = servers.values().map(|s| s.tools.len()).sum();

    Json(serde_json::json!({
        "status": if failing.is_empty() { "ok" } else { "degraded" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checked_at": Utc::now(),
        "checks": {
            "sessions": {
                "active": state.runtime.registry().len(),
            },
            "mcp": {
                "servers": servers.len(),
                "tools": tool_count,
                "failing": failing,
            },
            "slack": {
                "enabled": state.slack.is_some(),
            }
        }
    }))
}
