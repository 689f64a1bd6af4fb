use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolContext, ToolSpec, optional_string, require_string};
use async_trait::async_trait;
use serde::Serialize;

/// Runs SQL through the project's query service (`POST {service_url}/execute_sql`).
pub struct ExecuteSqlTool {
    http: reqwest::Client,
    execute_url: String,
}

#[derive(Debug, Serialize)]
struct ExecuteSqlRequest<'a> {
    sql: &'a str,
    nao_project_folder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_id: Option<String>,
}

impl ExecuteSqlTool {
    pub fn new(http: reqwest::Client, service_url: &str) -> Self {
        Self {
            http,
            execute_url: format!("{}/execute_sql", service_url.trim_end_matches('/')),
        }
    }
}

fn query_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("query_{}", &simple[..8])
}

/// Pulls `detail` out of an error body, falling back to the HTTP reason.
fn error_detail(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").cloned())
        .unwrap_or_else(|| {
            serde_json::Value::String(status.canonical_reason().unwrap_or("error").to_string())
        });
    format!("Error executing SQL query: {detail}")
}

fn with_query_id(data: serde_json::Value, id: String) -> serde_json::Value {
    match data {
        serde_json::Value::Object(mut map) => {
            map.insert("id".to_string(), serde_json::Value::String(id));
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({ "data": other, "id": id }),
    }
}

#[async_trait]
impl Tool for ExecuteSqlTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_sql".to_string(),
            description: "Execute a SQL query against the connected database and return the results. If multiple databases are configured, specify the database_id.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "sql_query": { "type": "string", "description": "The SQL query to execute." },
                    "database_id": { "type": "string", "description": "Database to run against when several are configured." }
                },
                "required": ["sql_query"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let sql_query = require_string(&arguments, "sql_query")?;
        let database_id = optional_string(&arguments, "database_id")?;
        let body = ExecuteSqlRequest {
            sql: &sql_query,
            nao_project_folder: ctx.project_folder().display().to_string(),
            database_id,
        };

        let response = self
            .http
            .post(&self.execute_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Error executing SQL query: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Error executing SQL query: {e}")))?;
        if !status.is_success() {
            tracing::warn!(%status, "sql service rejected query");
            return Err(ToolError::ExecutionFailed(error_detail(status, &text)));
        }

        let data: serde_json::Value = serde_json::from_str(&text)?;
        Ok(with_query_id(data, query_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn query_ids_have_eight_hex_chars() {
        let id = query_id();
        let hex = id.strip_prefix("query_").expect("prefix");
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn error_detail_prefers_service_detail() {
        assert_eq!(
            error_detail(StatusCode::BAD_REQUEST, r#"{"detail":"no such table: x"}"#),
            "Error executing SQL query: \"no such table: x\""
        );
        assert_eq!(
            error_detail(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            "Error executing SQL query: \"Internal Server Error\""
        );
    }

    #[test]
    fn query_id_is_attached_to_results() {
        let out = with_query_id(
            serde_json::json!({"columns": ["a"], "data": [{"a": 1}]}),
            "query_deadbeef".to_string(),
        );
        assert_eq!(out["id"], "query_deadbeef");
        assert_eq!(out["columns"], serde_json::json!(["a"]));
    }

    #[test]
    fn request_body_omits_missing_database() {
        let body = ExecuteSqlRequest {
            sql: "select 1",
            nao_project_folder: "/srv/p".to_string(),
            database_id: None,
        };
        assert_eq!(
            serde_json::to_value(&body).expect("json"),
            serde_json::json!({"sql": "select 1", "nao_project_folder": "/srv/p"})
        );
    }
}
