use thiserror::Error;

pub type Result<T> = std::result::Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("mcp config error: {0}")]
    Config(String),

    #[error("failed to connect to MCP server '{server}': {message}")]
    Connect { server: String, message: String },

    #[error("Tool {0} not found in any server")]
    ToolNotFound(String),

    #[error("tool call failed: {0}")]
    ToolFailed(String),

    #[error("mcp transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("config watch error: {0}")]
    Watch(String),
}

impl McpError {
    /// Errors after which the connection should be treated as dead.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<notify::Error> for McpError {
    fn from(e: notify::Error) -> Self {
        Self::Watch(e.to_string())
    }
}
