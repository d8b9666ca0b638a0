//! Tool system
//!
//! This module provides:
//! - `Tool` trait - Interface for application operations callable by the model
//! - `FnTool` - Tool built from a closure
//! - `ToolRegistry` - Registry with category enablement and keyword detection
//! - `ToolProvider` trait - A category of related tools

mod provider;
mod registry;
mod tool;

pub use provider::{StaticToolProvider, ToolProvider};
pub use registry::ToolRegistry;
pub use tool::{FnTool, Tool, ToolDeclaration, ToolResult};
