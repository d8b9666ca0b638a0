//! Model selection and the shared model handle
//!
//! At startup the [`ModelSelector`] may replace the configured model with a better
//! one the remote service advertises. The result is published through a
//! [`ModelHandle`]; every code path reads the model from the same handle, so a
//! later switch takes effect on the next call.
//!
//! ```ignore
//! let handle = ModelHandle::new(&config.model);
//! if let Some(best) = selector.select_best_model(&config.model, &cancel).await {
//!     handle.set_model(best).await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::{ChatError, ChatResult};

use super::credentials::CredentialHandle;
use super::transport::Transport;
use super::types::RemoteModelDescriptor;

/// Preferred models, best first
pub const PREFERRED_MODELS: &[&str] = &[
    "grok-4-1-fast-reasoning",
    "grok-4-fast-reasoning",
    "grok-4",
    "grok-3",
    "grok-3-mini",
];

/// Family prefixes accepted when no preferred model is available
pub const KNOWN_FAMILY_PREFIXES: &[&str] = &["grok-4", "grok-3", "grok"];

/// Handle to the model used by every request path
///
/// Cheap to clone; all clones see the same model.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<RwLock<String>>,
}

impl ModelHandle {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model.into())),
        }
    }

    /// The current model id
    pub async fn current(&self) -> String {
        self.inner.read().await.clone()
    }

    /// Switch the model for subsequent calls
    ///
    /// In-flight requests keep the model they already read.
    pub async fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        let mut guard = self.inner.write().await;
        if *guard != model {
            tracing::info!("[Models] Switching model {} -> {}", *guard, model);
            *guard = model;
        }
    }
}

/// A capability-aware model discovery service registered by the host
#[async_trait]
pub trait ModelDiscovery: Send + Sync {
    /// Best model for this application, or `None` to keep `configured`
    async fn best_model(
        &self,
        configured: &str,
        cancel: &CancellationToken,
    ) -> ChatResult<Option<String>>;
}

/// Picks the model to use at startup
pub struct ModelSelector {
    discovery: Option<Arc<dyn ModelDiscovery>>,
    transport: Transport,
    credential: CredentialHandle,
    models_url: Url,
    timeout: Duration,
}

impl ModelSelector {
    pub fn new(transport: Transport, credential: CredentialHandle, models_url: Url) -> Self {
        Self {
            discovery: None,
            transport,
            credential,
            models_url,
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ModelDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Choose a better model than `configured`, or `None` to keep it
    ///
    /// Never fails: discovery errors and the deadline keep the configured model.
    pub async fn select_best_model(
        &self,
        configured: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        match tokio::time::timeout(self.timeout, self.discover(configured, cancel)).await {
            Ok(Ok(choice)) => {
                match &choice {
                    Some(model) => tracing::info!("[Models] Selected model {}", model),
                    None => tracing::info!("[Models] Keeping configured model {}", configured),
                }
                choice
            }
            Ok(Err(e)) => {
                tracing::warn!("[Models] Model discovery failed, keeping {}: {}", configured, e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "[Models] Model discovery timed out after {:?}, keeping {}",
                    self.timeout,
                    configured
                );
                None
            }
        }
    }

    async fn discover(
        &self,
        configured: &str,
        cancel: &CancellationToken,
    ) -> ChatResult<Option<String>> {
        if let Some(discovery) = &self.discovery {
            match discovery.best_model(configured, cancel).await {
                Ok(choice) => return Ok(choice),
                Err(ChatError::Cancelled) => return Err(ChatError::Cancelled),
                Err(e) => {
                    tracing::warn!("[Models] Discovery service failed, listing models: {}", e)
                }
            }
        }

        let models = self.list_models(cancel).await?;
        tracing::debug!("[Models] Remote advertises {} model(s)", models.len());
        Ok(choose_from(&models))
    }

    /// `GET /models`
    pub async fn list_models(
        &self,
        cancel: &CancellationToken,
    ) -> ChatResult<Vec<RemoteModelDescriptor>> {
        let credential = self.credential.current().await;
        let secret = credential.secret().ok_or(ChatError::CredentialMissing)?;
        let body = self
            .transport
            .get_json(&self.models_url, secret, self.timeout, cancel)
            .await?;
        Ok(parse_model_list(&body))
    }
}

/// First preferred model present remotely, else the first id of a known family
pub fn choose_from(models: &[RemoteModelDescriptor]) -> Option<String> {
    let available = |id: &str| models.iter().any(|m| m.id.eq_ignore_ascii_case(id));

    if let Some(preferred) = PREFERRED_MODELS.iter().find(|id| available(id)) {
        return Some(preferred.to_string());
    }

    KNOWN_FAMILY_PREFIXES.iter().find_map(|prefix| {
        models
            .iter()
            .find(|m| m.id.to_ascii_lowercase().starts_with(prefix))
            .map(|m| m.id.clone())
    })
}

/// Accepts `{"data": [...]}`, `{"models": [...]}` or a bare array
pub fn parse_model_list(body: &Value) -> Vec<RemoteModelDescriptor> {
    let entries = body
        .get("data")
        .or_else(|| body.get("models"))
        .unwrap_or(body)
        .as_array();

    entries
        .into_iter()
        .flatten()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect()
}
