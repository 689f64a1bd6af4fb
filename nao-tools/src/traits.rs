use crate::error::{Result, ToolError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Per-call execution scope handed to local tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    project_folder: PathBuf,
}

impl ToolContext {
    pub fn new(project_folder: impl AsRef<Path>) -> Result<Self> {
        let project_folder = project_folder.as_ref();
        if project_folder.as_os_str().is_empty() {
            return Err(ToolError::InvalidArguments(
                "project folder is required".to_string(),
            ));
        }
        let absolute = std::path::absolute(project_folder)?;
        Ok(Self {
            project_folder: crate::paths::normalize(&absolute),
        })
    }

    pub fn project_folder(&self) -> &Path {
        &self.project_folder
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

pub fn to_llm_tool_def(spec: &ToolSpec) -> nao_llm::ToolDefinition {
    nao_llm::ToolDefinition {
        name: spec.name.clone(),
        description: spec.description.clone(),
        parameters: spec.parameters_schema.clone(),
    }
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_bool(args: &serde_json::Value, key: &str) -> Result<Option<bool>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "key {key} must be boolean, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_usize(args: &serde_json::Value, key: &str) -> Result<Option<usize>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => match n.as_u64() {
            Some(v) => Ok(Some(v as usize)),
            // Models sometimes send 10.0 for an integer field.
            None => match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(Some(f as usize)),
                _ => Err(ToolError::InvalidArguments(format!(
                    "key {key} must be a non-negative integer, got {n}"
                ))),
            },
        },
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "key {key} must be number, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn argument_helpers_reject_wrong_types() {
        let args = json!({"a": "x", "b": 3, "c": true, "d": 4.0, "e": null});
        assert_eq!(require_string(&args, "a").expect("a"), "x");
        assert!(require_string(&args, "b").is_err());
        assert!(require_string(&args, "missing").is_err());
        assert_eq!(optional_string(&args, "e").expect("e"), None);
        assert_eq!(optional_bool(&args, "c").expect("c"), Some(true));
        assert!(optional_bool(&args, "a").is_err());
        assert_eq!(optional_usize(&args, "b").expect("b"), Some(3));
        assert_eq!(optional_usize(&args, "d").expect("d"), Some(4));
        assert!(optional_usize(&args, "a").is_err());
    }

    #[test]
    fn context_normalizes_project_folder() {
        let ctx = ToolContext::new("/tmp/project/./sub/..").expect("ctx");
        assert_eq!(ctx.project_folder(), Path::new("/tmp/project"));
        assert!(ToolContext::new("").is_err());
    }
}
