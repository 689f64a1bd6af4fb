use crate::error::{Result, ToolError};
use crate::paths::{to_real_path, to_virtual_path, walk_files};
use crate::search::GlobFilter;
use crate::traits::{
    Tool, ToolContext, ToolSpec, optional_bool, optional_string, optional_usize, require_string,
};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_RESULTS: usize = 100;
const MAX_GREP_FILE_SIZE: u64 = 5 * 1024 * 1024;
const MAX_WALK: usize = 50_000;

pub struct GrepTool;

#[derive(Debug, Serialize)]
struct GrepMatch {
    path: String,
    line_number: usize,
    line_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_before: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_after: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct GrepOutput {
    matches: Vec<GrepMatch>,
    total_matches: usize,
    truncated: bool,
}

struct GrepRequest {
    regex: Regex,
    filter: Option<GlobFilter>,
    context_lines: usize,
    max_results: usize,
}

fn grep_blocking(project: &Path, start: &Path, req: &GrepRequest) -> Result<GrepOutput> {
    let mut out = GrepOutput {
        matches: Vec::new(),
        total_matches: 0,
        truncated: false,
    };

    let files: Vec<PathBuf> = walk_files(start, MAX_WALK);
    for file in files {
        let virtual_path = to_virtual_path(&file, project)?;
        let included = req
            .filter
            .as_ref()
            .is_none_or(|f| f.matches(virtual_path.trim_start_matches('/')));
        if !included {
            continue;
        }
        if std::fs::metadata(&file).map(|m| m.len()).unwrap_or(u64::MAX) > MAX_GREP_FILE_SIZE {
            continue;
        }
        // Binary and non UTF-8 files are skipped.
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };

        let lines: Vec<&str> = content.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            if !req.regex.is_match(line) {
                continue;
            }
            out.total_matches += 1;
            if out.matches.len() >= req.max_results {
                out.truncated = true;
                continue;
            }

            let (context_before, context_after) = if req.context_lines > 0 {
                let from = idx.saturating_sub(req.context_lines);
                let to = (idx + 1 + req.context_lines).min(lines.len());
                (
                    Some(lines[from..idx].iter().map(|s| s.to_string()).collect()),
                    Some(lines[idx + 1..to].iter().map(|s| s.to_string()).collect()),
                )
            } else {
                (None, None)
            };

            out.matches.push(GrepMatch {
                path: virtual_path.clone(),
                line_number: idx + 1,
                line_content: line.to_string(),
                context_before,
                context_after,
            });
        }
    }

    Ok(out)
}

#[async_trait]
impl Tool for GrepTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "grep".to_string(),
            description: "Search file contents in the project with a regular expression.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "pattern": { "type": "string", "description": "The regex pattern to search for in file contents." },
                    "path": { "type": "string", "description": "File or directory path to search in. Defaults to project root." },
                    "glob": { "type": "string", "description": "Glob pattern to filter files (e.g. \"*.sql\")." },
                    "case_insensitive": { "type": "boolean" },
                    "context_lines": { "type": "integer", "minimum": 0 },
                    "max_results": { "type": "integer", "minimum": 1, "description": "Defaults to 100." }
                },
                "required": ["pattern"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let pattern = require_string(&arguments, "pattern")?;
        let path = optional_string(&arguments, "path")?.unwrap_or_else(|| "/".to_string());
        let case_insensitive = optional_bool(&arguments, "case_insensitive")?.unwrap_or(false);

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?;
        let filter = optional_string(&arguments, "glob")?
            .map(|g| GlobFilter::new(&g))
            .transpose()?;

        let req = GrepRequest {
            regex,
            filter,
            context_lines: optional_usize(&arguments, "context_lines")?.unwrap_or(0),
            max_results: optional_usize(&arguments, "max_results")?
                .unwrap_or(DEFAULT_MAX_RESULTS)
                .max(1),
        };

        let project = ctx.project_folder().to_path_buf();
        let start = to_real_path(&path, &project)?;
        if !start.exists() {
            return Err(ToolError::ExecutionFailed(format!("path not found: {path}")));
        }

        let output = tokio::task::spawn_blocking(move || grep_blocking(&project, &start, &req))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("grep task failed: {e}")))??;
        tracing::debug!(
            total_matches = output.total_matches,
            truncated = output.truncated,
            "grep finished"
        );
        Ok(serde_json::to_value(output)?)
    }
}
