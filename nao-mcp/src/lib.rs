//! Pool of MCP tool-server connections.
//!
//! [`McpPool`] owns the per-server connections (lazy connect, idle eviction,
//! reconnect on transport failure). [`McpService`] wraps it with the config
//! file lifecycle: initial sweep, debounced hot reload, and the atomically
//! swapped tool catalog that sessions read from.

mod catalog;
mod config;
mod connection;
mod error;
mod pool;
mod rmcp_client;
mod service;
mod watcher;

pub use catalog::{McpCatalog, McpToolInfo, ServerState};
pub use config::{McpServerConfig, ServerConfigs, load_config, parse_config, substitute_env};
pub use connection::{McpConnection, McpConnector};
pub use error::{McpError, Result};
pub use pool::McpPool;
pub use rmcp_client::RmcpConnector;
pub use service::{McpService, McpSettings};
