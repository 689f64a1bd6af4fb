use crate::error::Result;
use crate::paths::{is_excluded_entry, to_real_path, to_virtual_path};
use crate::traits::{Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;
use serde::Serialize;

pub struct ListTool;

#[derive(Debug, Serialize)]
struct ListEntry {
    path: String,
    name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
    #[serde(rename = "itemCount", skip_serializing_if = "Option::is_none")]
    item_count: Option<usize>,
}

#[async_trait]
impl Tool for ListTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list".to_string(),
            description: "List the entries of a project directory.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string", "description": "The path to list." }
                },
                "required": ["path"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let path = require_string(&arguments, "path")?;
        let real = to_real_path(&path, ctx.project_folder())?;

        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&real).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_excluded_entry(&name) {
                continue;
            }
            let full = entry.path();
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                Some("directory")
            } else if file_type.is_file() {
                Some("file")
            } else if file_type.is_symlink() {
                Some("symbolic_link")
            } else {
                None
            };

            let (size, item_count) = if file_type.is_dir() {
                (None, count_entries(&full).await)
            } else {
                let size = tokio::fs::metadata(&full)
                    .await
                    .ok()
                    .map(|m| m.len().to_string());
                (size, None)
            };

            entries.push(ListEntry {
                path: to_virtual_path(&full, ctx.project_folder())?,
                name,
                kind,
                size,
                item_count,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(serde_json::to_value(entries)?)
    }
}

async fn count_entries(dir: &std::path::Path) -> Option<usize> {
    let mut rd = tokio::fs::read_dir(dir).await.ok()?;
    let mut count = 0;
    while let Ok(Some(_)) = rd.next_entry().await {
        count += 1;
    }
    Some(count)
}
