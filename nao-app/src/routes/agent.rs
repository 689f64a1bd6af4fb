use crate::agent::{AgentError, AgentRequest};
use crate::resolver::ModelSelection;
use crate::routes::error_response;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

/// Header carrying the caller's identity; requests without it act as the local user.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const CHAT_ID_HEADER: &str = "x-chat-id";
const LOCAL_USER_ID: &str = "local";

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/agent", post(start_agent))
        .route("/api/agent/{chat_id}/stop", post(stop_agent))
}

#[derive(Debug, Deserialize)]
struct AgentBody {
    message: MessageBody,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    model: Option<ModelSelection>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
}

fn user_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(LOCAL_USER_ID)
        .to_string()
}

/// Streams session events as SSE. Dropping the connection does not stop the
/// session; the answer is still persisted.
#[tracing::instrument(level = "info", skip_all)]
async fn start_agent(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AgentBody>,
) -> Response {
    let req = AgentRequest {
        user_id: user_id_from_headers(&headers),
        text: body.message.text,
        chat_id: body.chat_id,
        project_id: body.project_id,
        model: body.model,
        slack_thread_id: None,
    };
    let run = match state.runtime.start(req).await {
        Ok(run) => run,
        Err(e) => return agent_error_response(e),
    };

    let events = run
        .events
        .map(|event| Event::default().event(event.name()).json_data(&event));
    (
        [(CHAT_ID_HEADER, run.chat_id)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

#[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id))]
async fn stop_agent(
    Extension(state): Extension<Arc<AppState>>,
    Path(chat_id): Path<String>,
) -> Response {
    if state.runtime.stop(&chat_id) {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        )
            .into_response()
    }
}

fn agent_error_response(e: AgentError) -> Response {
    let status = match &e {
        AgentError::InvalidRequest(_) | AgentError::Config(_) => StatusCode::BAD_REQUEST,
        AgentError::ChatNotFound(_) => StatusCode::NOT_FOUND,
        AgentError::Forbidden => StatusCode::FORBIDDEN,
        AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "agent request failed");
    } else {
        tracing::warn!(status = status.as_u16(), error = %e, "agent request rejected");
    }
    error_response(status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{router, test_app};
    use crate::session::testing::{Script, done, text};
    use crate::store::ChatStore;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn post_json(uri: &str, user: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn streams_events_and_persists_answer() {
        let app = test_app(
            vec![Script::Chunks(vec![text("42 users"), done("end_turn")])],
            None,
        );
        let response = router(&app)
            .oneshot(post_json(
                "/api/agent",
                Some("u1"),
                serde_json::json!({ "message": { "text": "how many users?" } }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let chat_id = response
            .headers()
            .get(CHAT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .expect("chat id header");

        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = String::from_utf8(bytes.to_vec()).expect("utf8");
        let new_chat = body.find("event: new_chat").expect("new_chat event");
        let delta = body.find("event: text_delta").expect("text_delta event");
        let finish = body.find("event: finish").expect("finish event");
        assert!(new_chat < delta && delta < finish);
        assert!(body.contains("42 users"));

        let loaded = app
            .harness
            .store
            .load_chat(&chat_id)
            .await
            .expect("load")
            .expect("chat");
        assert_eq!(loaded.chat.user_id, "u1");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].text, "42 users");
    }

    #[tokio::test]
    async fn maps_runtime_errors_to_statuses() {
        let app = test_app(vec![], None);

        let response = router(&app)
            .oneshot(post_json(
                "/api/agent",
                None,
                serde_json::json!({ "message": { "text": "  " } }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(&app)
            .oneshot(post_json(
                "/api/agent",
                None,
                serde_json::json!({ "message": { "text": "hi" }, "chat_id": "nope" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["error"], "Chat with id nope not found.");

        let response = router(&app)
            .oneshot(post_json(
                "/api/agent",
                None,
                serde_json::json!({
                    "message": { "text": "hi" },
                    "model": { "provider": "openai", "model": "gpt-4.1" }
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_without_session_is_not_found() {
        let app = test_app(vec![], None);
        let response = router(&app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/agent/missing/stop")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn user_header_defaults_to_local() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id_from_headers(&headers), "local");
        headers.insert(USER_ID_HEADER, "  u7 ".parse().expect("header"));
        assert_eq!(user_id_from_headers(&headers), "u7");
    }
}
