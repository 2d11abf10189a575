//! MCP admin toolset: typed management tools over the service layer.

pub mod tools;

pub use tools::{build_registry, ToolDescriptor, ToolRegistry};
