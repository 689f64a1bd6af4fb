pub mod agent;
pub mod health;
pub mod mcp;
pub mod slack;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(agent::router())
        .merge(mcp::router())
        .merge(slack::router())
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": message.into(),
        })),
    )
        .into_response()
}
