use crate::error::{Result, ToolError};
use crate::paths::{to_virtual_path, walk_files};
use crate::traits::{Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use std::path::Path;

const MAX_RESULTS: usize = 1000;
const MAX_WALK: usize = 50_000;

/// Glob filter over project-relative paths.
///
/// A pattern without `/` also matches on the bare file name, so `*.sql`
/// finds files at any depth.
pub(crate) struct GlobFilter {
    pattern: Pattern,
    name_only: bool,
}

impl GlobFilter {
    pub(crate) fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_start_matches('/');
        let pattern = Pattern::new(trimmed)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid glob pattern: {e}")))?;
        Ok(Self {
            pattern,
            name_only: !trimmed.contains('/'),
        })
    }

    pub(crate) fn matches(&self, relative: &str) -> bool {
        let opts = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        if self.pattern.matches_with(relative, opts) {
            return true;
        }
        if self.name_only {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            return self.pattern.matches_with(name, opts);
        }
        false
    }
}

pub struct SearchTool;

#[derive(Debug, Serialize)]
struct SearchHit {
    path: String,
    dir: String,
    size: String,
}

fn parent_dir(virtual_path: &str) -> String {
    match virtual_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => virtual_path[..idx].to_string(),
    }
}

fn search_blocking(root: &Path, filter: &GlobFilter) -> Result<Vec<SearchHit>> {
    let mut hits = Vec::new();
    for file in walk_files(root, MAX_WALK) {
        let virtual_path = to_virtual_path(&file, root)?;
        if !filter.matches(virtual_path.trim_start_matches('/')) {
            continue;
        }
        let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
        hits.push(SearchHit {
            dir: parent_dir(&virtual_path),
            path: virtual_path,
            size: size.to_string(),
        });
        if hits.len() >= MAX_RESULTS {
            break;
        }
    }
    Ok(hits)
}

#[async_trait]
impl Tool for SearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search".to_string(),
            description: "Find project files whose path matches a glob pattern (e.g. `**/*.sql`, `models/*.yml`)."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "pattern": { "type": "string", "description": "The pattern to search for. Can be a glob pattern." }
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
        let filter = GlobFilter::new(&pattern)?;
        let root = ctx.project_folder().to_path_buf();

        let hits = tokio::task::spawn_blocking(move || search_blocking(&root, &filter))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("search task failed: {e}")))??;
        tracing::debug!(pattern = %pattern, hits = hits.len(), "search finished");
        Ok(serde_json::to_value(hits)?)
    }
}
