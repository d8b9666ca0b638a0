//! Chat client configuration
//!
//! `ChatConfig` is consumed, not owned, by the core: the host loads it from a JSON
//! file and/or hierarchical environment variables (`CHAT__MODEL`, ...) and hands it
//! to [`OrchestratorBuilder`](crate::orchestrator::OrchestratorBuilder).
//!
//! ```ignore
//! let config = ChatConfig::from_file("chat.json")?
//!     .with_env_overrides()
//!     .with_model("grok-4")
//!     .with_tool_category("budget", true);
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::error::{ChatError, ChatResult};

/// Prefix for configuration environment variables (`CHAT__MODEL`, ...)
const CONFIG_ENV_PREFIX: &str = "CHAT";

/// Which request/response schema the remote endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireShape {
    /// Flat `messages` array posted to `/chat/completions`
    LegacyChat,
    /// Request-scoped `input` array posted to `/responses`, with server-side storage
    Responses,
}

impl WireShape {
    /// Path suffix appended to the endpoint base URL
    pub fn path_suffix(&self) -> &'static str {
        match self {
            WireShape::LegacyChat => "chat/completions",
            WireShape::Responses => "responses",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy_chat" | "legacy" | "chat" | "chat_completions" => Some(WireShape::LegacyChat),
            "responses" | "response" => Some(WireShape::Responses),
            _ => None,
        }
    }
}

/// Configuration for the chat client and orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Model identifier used when auto-selection is off or finds nothing better
    pub model: String,

    /// Base endpoint URL, e.g. `https://api.x.ai/v1`
    pub endpoint: String,

    /// Wire schema spoken by the endpoint
    pub wire_shape: WireShape,

    /// Sampling temperature (optional)
    pub temperature: Option<f32>,

    /// Default presence penalty; never sent to reasoning models
    pub presence_penalty: Option<f32>,

    /// Default frequency penalty; never sent to reasoning models
    pub frequency_penalty: Option<f32>,

    /// Ask the model selector for a better model at startup
    pub auto_select_model: bool,

    /// Use the SDK-mediated chat service when one is registered
    pub sdk_enabled: bool,

    /// Request server-side storage so responses can be continued by id
    pub store_responses: bool,

    /// Keywords that mark a prompt as tool-heavy
    pub tool_keywords: Vec<String>,

    /// Per-category tool enablement; categories not listed are enabled
    pub tool_categories: HashMap<String, bool>,

    /// Upper bound on tool-call round trips within one call
    pub max_tool_iterations: usize,

    /// Ceiling for one HTTP request, including a streamed body
    pub request_timeout_secs: u64,

    /// Deadline for model discovery
    pub discovery_timeout_secs: u64,

    /// Deadline for key validation
    pub validation_timeout_secs: u64,

    /// Lifetime of cached conversation histories
    pub history_cache_ttl_secs: u64,

    /// Maximum characters of an error body kept for diagnostics
    pub max_error_body_chars: usize,

    /// Prefix for API key environment variables (`XAI__API_KEY`, `XAI_API_KEY`)
    pub key_env_prefix: String,

    /// Static API key (lowest priority credential source)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Development secrets file (highest priority credential source)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_file: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "grok-4".to_string(),
            endpoint: "https://api.x.ai/v1".to_string(),
            wire_shape: WireShape::Responses,
            temperature: Some(0.7),
            presence_penalty: None,
            frequency_penalty: None,
            auto_select_model: false,
            sdk_enabled: true,
            store_responses: true,
            tool_keywords: default_tool_keywords(),
            tool_categories: HashMap::new(),
            max_tool_iterations: 5,
            request_timeout_secs: 120,
            discovery_timeout_secs: 3,
            validation_timeout_secs: 15,
            history_cache_ttl_secs: 30 * 60,
            max_error_body_chars: 2000,
            key_env_prefix: "XAI".to_string(),
            api_key: None,
            secrets_file: None,
        }
    }
}

fn default_tool_keywords() -> Vec<String> {
    ["budget", "variance", "forecast", "enterprise", "compliance", "rate"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl ChatConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> ChatResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ChatError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ChatConfig = serde_json::from_str(&contents).map_err(|e| {
            ChatError::InvalidConfig(format!("invalid config {}: {}", path.display(), e))
        })?;
        tracing::info!("[Config] Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Overlay `CHAT__*` variables from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Overlay `CHAT__*` values from an arbitrary lookup
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(&format!("{}__{}", CONFIG_ENV_PREFIX, key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(model) = get("MODEL") {
            self.model = model;
        }
        if let Some(endpoint) = get("ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(shape) = get("WIRE_SHAPE") {
            match WireShape::parse(&shape) {
                Some(parsed) => self.wire_shape = parsed,
                None => tracing::warn!("[Config] Ignoring unknown wire shape '{}'", shape),
            }
        }
        if let Some(flag) = get("SDK_ENABLED").and_then(|v| parse_bool(&v)) {
            self.sdk_enabled = flag;
        }
        if let Some(flag) = get("AUTO_SELECT_MODEL").and_then(|v| parse_bool(&v)) {
            self.auto_select_model = flag;
        }
        if let Some(secs) = get("REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
        if let Some(keywords) = get("TOOL_KEYWORDS") {
            self.tool_keywords = keywords
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        self
    }

    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the endpoint base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the wire shape
    pub fn with_wire_shape(mut self, shape: WireShape) -> Self {
        self.wire_shape = shape;
        self
    }

    /// Set default penalties
    pub fn with_penalties(mut self, presence: Option<f32>, frequency: Option<f32>) -> Self {
        self.presence_penalty = presence;
        self.frequency_penalty = frequency;
        self
    }

    /// Enable or disable the SDK-mediated path
    pub fn with_sdk_enabled(mut self, enabled: bool) -> Self {
        self.sdk_enabled = enabled;
        self
    }

    /// Enable or disable model auto-selection
    pub fn with_auto_select_model(mut self, enabled: bool) -> Self {
        self.auto_select_model = enabled;
        self
    }

    /// Set the static API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the development secrets file
    pub fn with_secrets_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secrets_file = Some(path.into());
        self
    }

    /// Replace the tool-heavy keyword list
    pub fn with_tool_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable a tool category
    pub fn with_tool_category(mut self, category: impl Into<String>, enabled: bool) -> Self {
        self.tool_categories.insert(category.into(), enabled);
        self
    }

    /// Set the request timeout override
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Parse the endpoint base URL
    pub fn endpoint_url(&self) -> ChatResult<Url> {
        let mut base = self.endpoint.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = Url::parse(&base)
            .map_err(|e| ChatError::InvalidConfig(format!("endpoint '{}': {}", self.endpoint, e)))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(ChatError::InvalidConfig(format!(
                "endpoint '{}' is not an http(s) base URL",
                self.endpoint
            )));
        }
        Ok(url)
    }

    /// URL for a path relative to the endpoint base
    pub fn url_for(&self, suffix: &str) -> ChatResult<Url> {
        self.endpoint_url()?
            .join(suffix.trim_start_matches('/'))
            .map_err(|e| ChatError::InvalidConfig(format!("endpoint path '{}': {}", suffix, e)))
    }

    /// Whether a tool category is enabled (unlisted categories are enabled)
    pub fn is_category_enabled(&self, category: &str) -> bool {
        self.tool_categories.get(category).copied().unwrap_or(true)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.min(3))
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs.clamp(10, 30))
    }

    pub fn history_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.history_cache_ttl_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
