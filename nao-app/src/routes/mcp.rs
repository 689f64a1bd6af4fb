use crate::routes::error_response;
use crate::server::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/mcp/state", get(get_state))
        .route("/api/mcp/reconnect", post(reconnect))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_state(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "servers": state.mcp.state().await }))
}

/// Re-reads the MCP config and reconnects every server.
#[tracing::instrument(level = "info", skip_all)]
async fn reconnect(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.mcp.reload().await {
        Ok(()) => Json(serde_json::json!({ "servers": state.mcp.state().await })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "mcp reconnect failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::server::testing::{router, test_app};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn state_is_empty_without_config() {
        let app = test_app(vec![], None);
        let response = router(&app)
            .oneshot(
                Request::builder()
                    .uri("/api/mcp/state")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["servers"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn reconnect_without_config_path_reports_error() {
        let app = test_app(vec![], None);
        let response = router(&app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/mcp/reconnect")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert!(
            body["error"]
                .as_str()
                .is_some_and(|e| e.contains("config path"))
        );
    }
}
