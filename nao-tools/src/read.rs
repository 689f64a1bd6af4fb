use crate::error::Result;
use crate::paths::to_real_path;
use crate::traits::{Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read".to_string(),
            description: "Read the full contents of a file in the project.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "file_path": { "type": "string", "description": "Virtual path of the file; / is the project root." }
                },
                "required": ["file_path"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let file_path = require_string(&arguments, "file_path")?;
        let real = to_real_path(&file_path, ctx.project_folder())?;
        let content = tokio::fs::read_to_string(&real).await?;
        let total_lines = content.split('\n').count();
        Ok(serde_json::json!({
            "content": content,
            "numberOfTotalLines": total_lines,
        }))
    }
}
