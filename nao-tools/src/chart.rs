use crate::error::Result;
use crate::traits::{Tool, ToolContext, ToolSpec, optional_string, require_string};
use async_trait::async_trait;

/// Validates a chart request; rendering happens client side.
pub struct DisplayChartTool;

fn validate(chart_type: &str, x_axis_key: Option<&str>, series_len: usize) -> Option<String> {
    if matches!(chart_type, "bar" | "line") && x_axis_key.is_none_or(str::is_empty) {
        return Some(format!("xAxisKey is required for {chart_type} charts."));
    }
    if chart_type == "pie" && series_len != 1 {
        return Some("Pie charts require exactly one series.".to_string());
    }
    if series_len == 0 {
        return Some("At least one series is required.".to_string());
    }
    None
}

#[async_trait]
impl Tool for DisplayChartTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "display_chart".to_string(),
            description: "Display a chart visualization of the data from a previous `execute_sql` tool call.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "query_id": { "type": "string", "description": "The id returned by execute_sql." },
                    "chart_type": { "type": "string", "enum": ["bar", "line", "area", "pie", "scatter"] },
                    "x_axis_key": { "type": "string" },
                    "series": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "data_key": { "type": "string" },
                                "color": { "type": "string" }
                            },
                            "required": ["data_key"]
                        }
                    },
                    "title": { "type": "string" }
                },
                "required": ["chart_type", "series"]
            }),
        }
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let chart_type = require_string(&arguments, "chart_type")?;
        let x_axis_key = optional_string(&arguments, "x_axis_key")?;
        let series_len = arguments
            .get("series")
            .and_then(|s| s.as_array())
            .map_or(0, Vec::len);

        match validate(&chart_type, x_axis_key.as_deref(), series_len) {
            Some(error) => Ok(serde_json::json!({ "error": error })),
            None => Ok(serde_json::json!({ "success": true })),
        }
    }
}
