//! Slack Events API and interactivity endpoints.
//!
//! Both are signed by Slack; [`verify_slack_request`] checks the signature
//! over the raw body before any handler parses it.

use crate::agent::AgentRequest;
use crate::routes::error_response;
use crate::server::{AppState, SlackState};
use crate::session::SessionEvent;
use axum::body::Body;
use axum::extract::Form;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use chrono::Utc;
use futures_util::StreamExt;
use nao_channels::{
    MessageRelay, RelayFragment, SlackEnvelope, SlackEvent, parse_interaction_form,
    verify_slack_signature,
};
use std::collections::HashMap;
use std::sync::Arc;

const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const SIGNATURE_HEADER: &str = "x-slack-signature";
const RETRY_HEADER: &str = "x-slack-retry-num";
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/slack/events", post(slack_events))
        .route("/api/slack/interactions", post(slack_interactions))
        .route_layer(axum::middleware::from_fn(verify_slack_request))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn verify_slack_request(
    Extension(state): Extension<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(slack) = state.slack.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "slack integration is not configured");
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("unreadable body: {e}"));
        }
    };
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    let verified = verify_slack_signature(
        &slack.signing_secret,
        header(TIMESTAMP_HEADER),
        &bytes,
        header(SIGNATURE_HEADER),
        Utc::now().timestamp(),
    );
    if !verified {
        tracing::warn!(uri = %parts.uri, "slack signature rejected");
        return error_response(StatusCode::UNAUTHORIZED, "invalid slack signature");
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[tracing::instrument(level = "info", skip_all)]
async fn slack_events(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(envelope): Json<SlackEnvelope>,
) -> Response {
    match envelope {
        SlackEnvelope::UrlVerification { challenge } => {
            Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        SlackEnvelope::EventCallback { event } => {
            if headers.contains_key(RETRY_HEADER) {
                // The first delivery is already being answered.
                tracing::debug!("ignoring slack retry");
            } else if event.is_app_mention() {
                if let Some(slack) = state.slack.clone() {
                    tokio::spawn(answer_mention(state.clone(), slack, event));
                }
            }
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        SlackEnvelope::Other => Json(serde_json::json!({ "ok": true })).into_response(),
    }
}

/// Runs one agent turn for a mention and mirrors its text into the thread.
async fn answer_mention(state: Arc<AppState>, slack: SlackState, event: SlackEvent) {
    let Some(thread) = event.thread() else {
        tracing::warn!("slack mention without channel or ts");
        return;
    };
    let thread_id = thread.thread_id();
    let user = event.user.clone().unwrap_or_else(|| "unknown".to_string());

    let mut req = AgentRequest::new(format!("slack:{user}"), event.prompt());
    match state
        .runtime
        .store()
        .find_chat_by_slack_thread(&thread_id)
        .await
    {
        Ok(Some(chat)) => req.chat_id = Some(chat.id),
        Ok(None) => req.slack_thread_id = Some(thread_id.clone()),
        Err(e) => {
            tracing::error!(thread_id = %thread_id, error = %e, "slack thread lookup failed");
            return;
        }
    }

    let mut relay = MessageRelay::new(slack.channel.clone(), thread);
    relay.post_placeholder().await;

    let run = match state.runtime.start(req).await {
        Ok(run) => run,
        Err(e) => {
            tracing::warn!(thread_id = %thread_id, error = %e, "slack mention rejected");
            relay
                .relay(futures_util::stream::iter([format!("❌ {e}")]))
                .await;
            return;
        }
    };
    relay.post_stop_button().await;

    let chat_id = run.chat_id;
    let fragments = run.events.filter_map(|event| async move {
        match event {
            SessionEvent::TextDelta { text } => Some(RelayFragment::Text(text)),
            SessionEvent::ToolCallStarted { .. } => Some(RelayFragment::StepBoundary),
            SessionEvent::Error { message } => Some(RelayFragment::Text(format!("\n❌ {message}"))),
            _ => None,
        }
    });
    let summary = relay.relay(fragments).await;
    relay.finish(&slack.conversation_url(&chat_id)).await;
    tracing::info!(
        chat_id = %chat_id,
        thread_id = %thread_id,
        chars = summary.text.len(),
        updates_sent = summary.updates_sent,
        updates_failed = summary.updates_failed,
        "slack answer relayed"
    );
}

#[tracing::instrument(level = "info", skip_all)]
async fn slack_interactions(
    Extension(state): Extension<Arc<AppState>>,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    let Some(interaction) =
        parse_interaction_form(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    else {
        return error_response(StatusCode::BAD_REQUEST, "missing or invalid payload");
    };
    if !interaction.is_stop_request() {
        return Json(serde_json::json!({ "ok": true })).into_response();
    }
    let Some(thread) = interaction.thread() else {
        tracing::warn!("stop request without thread");
        return Json(serde_json::json!({ "ok": true })).into_response();
    };

    let thread_id = thread.thread_id();
    match state
        .runtime
        .store()
        .find_chat_by_slack_thread(&thread_id)
        .await
    {
        Ok(Some(chat)) => {
            let stopped = state.runtime.stop(&chat.id);
            tracing::info!(chat_id = %chat.id, stopped, "slack stop requested");
        }
        Ok(None) => tracing::warn!(thread_id = %thread_id, "stop requested for unknown thread"),
        Err(e) => tracing::error!(thread_id = %thread_id, error = %e, "slack thread lookup failed"),
    }
    Json(serde_json::json!({ "ok": true })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{TestApp, router, test_app};
    use crate::session::testing::{Script, done, text, tool_call};
    use crate::store::ChatStore;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use hmac::{Hmac, Mac};
    use nao_channels::{ChannelId, MessageTs, MessagingChannel};
    use sha2::Sha256;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::util::ServiceExt;

    const SECRET: &str = "test-signing-secret";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Post { text: String, blocks: bool },
        Update { ts: String, text: String },
    }

    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingChannel {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl MessagingChannel for RecordingChannel {
        async fn post_message(
            &self,
            _channel: &ChannelId,
            _thread_ts: Option<&MessageTs>,
            text: &str,
            blocks: Option<serde_json::Value>,
        ) -> anyhow::Result<MessageTs> {
            let mut calls = self.calls.lock().expect("calls");
            calls.push(Call::Post {
                text: text.to_string(),
                blocks: blocks.is_some(),
            });
            Ok(MessageTs::new(format!("reply.{}", calls.len())))
        }

        async fn update_message(
            &self,
            _channel: &ChannelId,
            ts: &MessageTs,
            text: &str,
            _blocks: Option<serde_json::Value>,
        ) -> anyhow::Result<()> {
            self.calls.lock().expect("calls").push(Call::Update {
                ts: ts.to_string(),
                text: text.to_string(),
            });
            Ok(())
        }
    }

    fn slack_app(scripts: Vec<Script>) -> (TestApp, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let app = test_app(
            scripts,
            Some(SlackState {
                channel: channel.clone(),
                signing_secret: SECRET.to_string(),
                redirect_url: "http://nao.local/".to_string(),
            }),
        );
        (app, channel)
    }

    fn signed(uri: &str, content_type: &str, body: String) -> Request<Body> {
        let ts = Utc::now().timestamp().to_string();
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("key");
        mac.update(format!("v0:{ts}:{body}").as_bytes());
        let signature = format!("v0={}", hex::encode(mac.finalize().into_bytes()));
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", content_type)
            .header(TIMESTAMP_HEADER, ts)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .expect("request")
    }

    fn mention(text: &str) -> String {
        serde_json::json!({
            "type": "event_callback",
            "event": {
                "type": "app_mention",
                "user": "U1",
                "text": text,
                "channel": "C9",
                "ts": "1700000000.000100"
            }
        })
        .to_string()
    }

    async fn wait_for_link(channel: &RecordingChannel) -> Vec<Call> {
        for _ in 0..200 {
            let calls = channel.calls();
            let linked = calls.iter().any(|c| {
                matches!(c, Call::Update { text, .. } if text.contains("View full conversation"))
            });
            if linked {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never finished: {:?}", channel.calls());
    }

    #[tokio::test]
    async fn rejects_unsigned_requests() {
        let (app, _channel) = slack_app(vec![]);
        let response = router(&app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/slack/events")
                    .header("content-type", "application/json")
                    .header(TIMESTAMP_HEADER, Utc::now().timestamp().to_string())
                    .header(SIGNATURE_HEADER, "v0=deadbeef")
                    .body(Body::from(r#"{"type":"url_verification","challenge":"c"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn disabled_slack_is_not_found() {
        let app = test_app(vec![], None);
        let response = router(&app)
            .oneshot(signed(
                "/api/slack/events",
                "application/json",
                r#"{"type":"url_verification","challenge":"c"}"#.to_string(),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn echoes_url_verification_challenge() {
        let (app, _channel) = slack_app(vec![]);
        let response = router(&app)
            .oneshot(signed(
                "/api/slack/events",
                "application/json",
                r#"{"type":"url_verification","challenge":"3eZbrw1aB"}"#.to_string(),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["challenge"], "3eZbrw1aB");
    }

    #[tokio::test]
    async fn mention_is_answered_in_thread_and_linked() {
        let (app, channel) = slack_app(vec![Script::Chunks(vec![
            text("Revenue grew\n"),
            text("by 12%"),
            done("end_turn"),
        ])]);
        let response = router(&app)
            .oneshot(signed(
                "/api/slack/events",
                "application/json",
                mention("<@UBOT> how did revenue do?"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let calls = wait_for_link(&channel).await;
        assert_eq!(
            calls[0],
            Call::Post {
                text: nao_channels::PLACEHOLDER_TEXT.to_string(),
                blocks: false
            }
        );
        assert!(matches!(&calls[1], Call::Post { blocks: true, .. }));
        let updates: Vec<&str> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Update { ts, text } if ts == "reply.1" => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec!["Revenue grew\n", "Revenue grew\nby 12%"]);

        let chat = app
            .harness
            .store
            .find_chat_by_slack_thread("C9/p1700000000000100")
            .await
            .expect("lookup")
            .expect("chat bound to thread");
        assert_eq!(chat.user_id, "slack:U1");
        assert_eq!(chat.title, "how did revenue do?");
        let link = calls.last().expect("link");
        assert_eq!(
            link,
            &Call::Update {
                ts: "reply.2".to_string(),
                text: format!("<http://nao.local/{}|View full conversation>", chat.id),
            }
        );
    }

    #[tokio::test]
    async fn thread_shows_the_latest_step_only() {
        let mut first = vec![text("Let me check the tables.\n")];
        first.extend(tool_call("t1", "list", r#"{"path":"/"}"#));
        first.push(done("tool_use"));
        let (app, channel) = slack_app(vec![
            Script::Chunks(first),
            Script::Chunks(vec![text("There are 42 users."), done("end_turn")]),
        ]);
        let response = router(&app)
            .oneshot(signed(
                "/api/slack/events",
                "application/json",
                mention("<@UBOT> how many users?"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let calls = wait_for_link(&channel).await;
        let updates: Vec<&str> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Update { ts, text } if ts == "reply.1" => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            updates,
            vec!["Let me check the tables.\n", "There are 42 users."]
        );
    }

    #[tokio::test]
    async fn retries_are_acknowledged_without_answering() {
        let (app, channel) = slack_app(vec![]);
        let mut request = signed(
            "/api/slack/events",
            "application/json",
            mention("<@UBOT> again?"),
        );
        request
            .headers_mut()
            .insert(RETRY_HEADER, "1".parse().expect("header"));
        let response = router(&app).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_button_interrupts_the_thread_session() {
        let (app, channel) = slack_app(vec![Script::Hang(vec![text("thinking\n")])]);
        let response = router(&app)
            .oneshot(signed(
                "/api/slack/events",
                "application/json",
                mention("<@UBOT> long question"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let mut chat_id = None;
        for _ in 0..200 {
            let chat = app
                .harness
                .store
                .find_chat_by_slack_thread("C9/p1700000000000100")
                .await
                .expect("lookup");
            if let Some(chat) = chat {
                if app.harness.runtime.registry().get(&chat.id).is_some() {
                    chat_id = Some(chat.id);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let chat_id = chat_id.expect("session registered");

        let payload = serde_json::json!({
            "type": "block_actions",
            "actions": [{ "action_id": "stop_generation", "type": "button" }],
            "channel": { "id": "C9" },
            "message": { "ts": "reply.2", "thread_ts": "1700000000.000100" }
        })
        .to_string();
        let form: String = [("payload", payload.as_str())]
            .iter()
            .map(|(k, v)| format!("{k}={}", form_encode(v)))
            .collect();
        let response = router(&app)
            .oneshot(signed(
                "/api/slack/interactions",
                "application/x-www-form-urlencoded",
                form,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        wait_for_link(&channel).await;
        let loaded = app
            .harness
            .store
            .load_chat(&chat_id)
            .await
            .expect("load")
            .expect("chat");
        let answer = loaded.messages.last().expect("assistant message");
        assert_eq!(
            answer.stop_reason.as_deref(),
            Some(crate::session::STOP_REASON_INTERRUPTED)
        );
    }

    fn form_encode(raw: &str) -> String {
        raw.bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'*' => {
                    (b as char).to_string()
                }
                _ => format!("%{b:02X}"),
            })
            .collect()
    }
}
