//! Tool Provider trait
//!
//! Groups related tools under a category so they can be enabled or disabled
//! together from configuration.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::tool::Tool;

/// A source of tools sharing one category
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Get all tools from this provider
    async fn get_tools(&self) -> Result<Vec<Arc<dyn Tool>>>;

    /// Category name, matched against `tool_categories` in configuration
    fn category(&self) -> &str;
}

/// A provider over a fixed list of tools
pub struct StaticToolProvider {
    category: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolProvider {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }
}

#[async_trait]
impl ToolProvider for StaticToolProvider {
    async fn get_tools(&self) -> Result<Vec<Arc<dyn Tool>>> {
        Ok(self.tools.clone())
    }

    fn category(&self) -> &str {
        &self.category
    }
}
