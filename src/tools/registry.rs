//! Tool registry for managing available tools
//!
//! Tools are registered explicitly at startup under a category, either one by one
//! or through a [`ToolProvider`]. Categories are enabled or disabled from
//! configuration; disabled tools are neither declared to the model nor invoked.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;

use super::provider::ToolProvider;
use super::tool::{Tool, ToolDeclaration, ToolResult};
use crate::core::{ChatConfig, ChatError};
use crate::llm::ToolCallRequest;

struct RegisteredTool {
    category: String,
    declaration: ToolDeclaration,
    tool: Arc<dyn Tool>,
}

/// Registry that holds all available tools
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    category_flags: HashMap<String, bool>,
    keyword_pattern: Option<Regex>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            category_flags: HashMap::new(),
            keyword_pattern: None,
        }
    }

    /// Registry with category flags and tool-heavy keywords from configuration
    pub fn from_config(config: &ChatConfig) -> Self {
        let mut registry = Self::new().with_keywords(&config.tool_keywords);
        registry.category_flags = config.tool_categories.clone();
        registry
    }

    /// Replace the keywords that mark a prompt as tool-heavy
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternatives: Vec<String> = keywords
            .into_iter()
            .filter(|k| !k.as_ref().trim().is_empty())
            .map(|k| regex::escape(k.as_ref().trim()))
            .collect();

        self.keyword_pattern = if alternatives.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("[ToolRegistry] Invalid keyword pattern: {}", e);
                    None
                }
            }
        };
        self
    }

    /// Register a tool under a category
    pub fn register<T: Tool + 'static>(&mut self, category: impl Into<String>, tool: T) {
        self.register_arc(category, Arc::new(tool));
    }

    /// Register a shared tool under a category
    pub fn register_arc(&mut self, category: impl Into<String>, tool: Arc<dyn Tool>) {
        let category = category.into();
        let declaration = tool.declaration();
        let name = declaration.name.clone();
        tracing::info!("[ToolRegistry] Registering tool '{}' ({})", name, category);
        if self.tools.contains_key(&name) {
            tracing::warn!("[ToolRegistry] Replacing existing tool '{}'", name);
        }
        self.tools.insert(
            name,
            RegisteredTool {
                category,
                declaration,
                tool,
            },
        );
    }

    /// Add every tool of a provider under its category
    ///
    /// Returns an error if any tool name conflicts with an existing tool.
    pub async fn add_provider(&mut self, provider: Arc<dyn ToolProvider>) -> Result<()> {
        tracing::info!("[ToolRegistry] Adding provider '{}'", provider.category());

        let tools = provider.get_tools().await?;
        if let Some(conflict) = tools.iter().find(|t| self.tools.contains_key(t.name())) {
            return Err(anyhow::anyhow!(
                "Tool name conflict: '{}' already exists (from provider '{}')",
                conflict.name(),
                provider.category()
            ));
        }

        for tool in tools {
            self.register_arc(provider.category(), tool);
        }
        Ok(())
    }

    /// Enable or disable a whole category
    pub fn set_category_enabled(&mut self, category: impl Into<String>, enabled: bool) {
        self.category_flags.insert(category.into(), enabled);
    }

    /// Categories not configured are enabled
    pub fn is_category_enabled(&self, category: &str) -> bool {
        self.category_flags.get(category).copied().unwrap_or(true)
    }

    fn enabled(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools
            .values()
            .filter(|t| self.is_category_enabled(&t.category))
    }

    /// Declarations of all enabled tools, sorted by name
    pub fn declarations(&self) -> Vec<&ToolDeclaration> {
        let mut declarations: Vec<_> = self.enabled().map(|t| &t.declaration).collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    pub fn has_enabled_tools(&self) -> bool {
        self.enabled().next().is_some()
    }

    /// A prompt is tool-heavy when it mentions a keyword and at least one tool is enabled
    pub fn is_tool_heavy(&self, prompt: &str) -> bool {
        let mentions_keyword = self
            .keyword_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(prompt));
        mentions_keyword && self.has_enabled_tools()
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.tool.clone())
    }

    /// Invoke a tool call from the model
    ///
    /// Never fails: unknown or disabled tools, bad arguments and tool errors all
    /// become an error result that is fed back to the model.
    pub async fn invoke(&self, call: &ToolCallRequest) -> ToolResult {
        let Some(registered) = self.tools.get(&call.name) else {
            tracing::warn!("[ToolRegistry] Model called unknown tool '{}'", call.name);
            return ToolResult::error(format!("Unknown tool: {}", call.name));
        };
        if !self.is_category_enabled(&registered.category) {
            tracing::warn!("[ToolRegistry] Model called disabled tool '{}'", call.name);
            return ToolResult::error(format!("Tool is disabled: {}", call.name));
        }

        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                let failure = ChatError::ToolInvocationFailure {
                    tool: call.name.clone(),
                    message: format!("invalid arguments: {}", e),
                };
                tracing::warn!("[ToolRegistry] {}", failure);
                return ToolResult::error(failure.to_string());
            }
        };

        tracing::info!("[ToolRegistry] Invoking tool: {}", call.name);
        tracing::debug!("[ToolRegistry] Arguments: {}", arguments);

        match registered.tool.invoke(&arguments).await {
            Ok(result) => {
                tracing::debug!(
                    "[ToolRegistry] Tool {} completed. Is error: {}",
                    call.name,
                    result.is_error
                );
                result
            }
            Err(e) => {
                let failure = ChatError::ToolInvocationFailure {
                    tool: call.name.clone(),
                    message: format!("{:#}", e),
                };
                tracing::error!("[ToolRegistry] {}", failure);
                ToolResult::error(failure.to_string())
            }
        }
    }

    /// Get the list of tool names
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
