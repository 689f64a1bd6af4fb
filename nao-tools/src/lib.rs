//! Tools the nao agent can call.
//!
//! Local tools operate on the project folder through virtual paths (`/` is the
//! project root). External tools arrive through [`ExternalTools`] and are merged
//! into the same [`ToolCatalog`].

mod catalog;
mod chart;
mod error;
mod grep;
mod list;
pub mod paths;
mod read;
mod search;
mod sql;
mod traits;

pub use catalog::{ExternalTools, ToolCatalog, builtin_tools};
pub use chart::DisplayChartTool;
pub use error::{Result, ToolError};
pub use grep::GrepTool;
pub use list::ListTool;
pub use read::ReadTool;
pub use search::SearchTool;
pub use sql::ExecuteSqlTool;
pub use traits::{Tool, ToolContext, ToolSpec, to_llm_tool_def};
