use crate::error::{McpError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

/// How to reach one MCP server.
#[derive(Debug, Clone, PartialEq)]
pub enum McpServerConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

pub type ServerConfigs = BTreeMap<String, McpServerConfig>;

#[derive(Debug, Deserialize)]
struct McpConfigFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, RawServerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

static ENV_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

/// Replaces `${VAR}` with `lookup(VAR)`; unknown variables become empty.
pub fn substitute_env(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let Some(re) = ENV_VAR.as_ref() else {
        return raw.to_string();
    };
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        lookup(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Parses an `mcpServers` document after environment substitution.
///
/// Entries that are neither a command nor a URL are skipped with a warning.
pub fn parse_config(
    raw: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServerConfigs> {
    let substituted = substitute_env(raw, lookup);
    let file: McpConfigFile = serde_json::from_str(&substituted)
        .map_err(|e| McpError::Config(format!("invalid mcp config json: {e}")))?;

    let mut out = ServerConfigs::new();
    for (name, server) in file.mcp_servers {
        let config = match (server.url, server.command) {
            (Some(url), _) if server.kind.as_deref().is_none_or(|k| k == "http") => {
                McpServerConfig::Http { url }
            }
            (_, Some(command)) => McpServerConfig::Stdio {
                command,
                args: server.args,
                env: server.env,
            },
            _ => {
                tracing::warn!(server = %name, "mcp server entry has neither command nor url; skipping");
                continue;
            }
        };
        out.insert(name, config);
    }
    Ok(out)
}

pub async fn load_config(path: &Path) -> Result<ServerConfigs> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        McpError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    parse_config(&raw, |name| std::env::var(name).ok())
}
