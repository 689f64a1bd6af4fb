use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// What callers see for one configured server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerState {
    pub tools: Vec<McpToolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable snapshot of every tool exposed by the connected servers.
#[derive(Debug, Clone, Default)]
pub struct McpCatalog {
    tools: Vec<McpToolInfo>,
    index: HashMap<String, String>,
    servers: BTreeMap<String, ServerState>,
}

impl McpCatalog {
    /// Builds the flat catalog. Servers are applied in name order, and a
    /// later server redefining a tool name takes it over.
    pub fn build(servers: BTreeMap<String, ServerState>) -> Self {
        let mut tools: Vec<McpToolInfo> = Vec::new();
        let mut index = HashMap::new();
        for (server, state) in &servers {
            for tool in &state.tools {
                match index.insert(tool.name.clone(), server.clone()) {
                    Some(previous) => {
                        tracing::warn!(
                            tool = %tool.name,
                            previous = %previous,
                            server = %server,
                            "mcp tool name redefined; later server wins"
                        );
                        if let Some(slot) = tools.iter_mut().find(|t| t.name == tool.name) {
                            *slot = tool.clone();
                        }
                    }
                    None => tools.push(tool.clone()),
                }
            }
        }
        Self {
            tools,
            index,
            servers,
        }
    }

    pub fn tools(&self) -> &[McpToolInfo] {
        &self.tools
    }

    pub fn server_for(&self, tool: &str) -> Option<&str> {
        self.index.get(tool).map(String::as_str)
    }

    pub fn servers(&self) -> &BTreeMap<String, ServerState> {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: &str) -> McpToolInfo {
        McpToolInfo {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn later_server_wins_on_name_collision() {
        let servers = BTreeMap::from([
            (
                "alpha".to_string(),
                ServerState {
                    tools: vec![tool("query", "alpha query"), tool("ping", "ping")],
                    error: None,
                },
            ),
            (
                "beta".to_string(),
                ServerState {
                    tools: vec![tool("query", "beta query")],
                    error: None,
                },
            ),
            (
                "gamma".to_string(),
                ServerState {
                    tools: vec![],
                    error: Some("spawn failed".to_string()),
                },
            ),
        ]);
        let catalog = McpCatalog::build(servers);

        assert_eq!(catalog.tools().len(), 2);
        assert_eq!(catalog.tools()[0].description, "beta query");
        assert_eq!(catalog.server_for("query"), Some("beta"));
        assert_eq!(catalog.server_for("ping"), Some("alpha"));
        assert_eq!(catalog.server_for("nope"), None);
        assert_eq!(
            catalog.servers()["gamma"].error.as_deref(),
            Some("spawn failed")
        );
    }
}
