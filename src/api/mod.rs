// HTTP API over the authentication tools

pub mod tools;

pub use tools::{create_tools_router, ToolsAppState};
