//! Error taxonomy for the chat client
//!
//! Transport and decode failures are classified into these variants at the
//! transport/decoder boundary. The orchestrator decides from the variant whether
//! to fall through to the next path or surface the error.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the remote chat-completion API
#[derive(Error, Debug)]
pub enum ChatError {
    /// No usable API key was found in any source
    #[error("No API key configured")]
    CredentialMissing,

    /// The remote service rejected the key (HTTP 401)
    #[error("API key rejected: {0}")]
    CredentialInvalid(String),

    /// The key is valid but lacks permission for this operation (HTTP 403)
    #[error("API key lacks required scope: {0}")]
    CredentialInsufficientScope(String),

    /// HTTP 429 persisted after all backoff retries
    #[error("Rate limited after {retries} retries: {body}")]
    RateLimited { retries: u32, body: String },

    /// Connection reset or aborted, already retried once
    #[error("Network failure: {0}")]
    TransientNetworkFailure(String),

    /// A configured deadline was exceeded
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The remote response did not match any recognized shape
    #[error("Malformed remote response: {reason}")]
    MalformedRemoteResponse { reason: String, body: String },

    /// A single tool invocation failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolInvocationFailure { tool: String, message: String },

    /// Non-2xx response that is not retried
    #[error("API error ({status}): {body}")]
    Http { status: u16, body: String },

    /// The SDK-mediated chat service is not registered or failed to initialize
    #[error("Chat service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Unrecoverable configuration problem (e.g. unparsable endpoint URL)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Conversation id cannot be used as a storage key
    #[error("Invalid conversation id: {0}")]
    InvalidConversationId(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    /// Create a malformed-response error keeping the raw body
    pub fn malformed(reason: impl Into<String>, body: impl Into<String>) -> Self {
        ChatError::MalformedRemoteResponse {
            reason: reason.into(),
            body: body.into(),
        }
    }

    /// Errors that must propagate to the caller instead of becoming a diagnostic
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, ChatError::Cancelled | ChatError::InvalidConfig(_))
    }

    /// Errors that no other code path can recover from, because every path
    /// shares the same key and quota
    pub fn is_credential_or_quota(&self) -> bool {
        matches!(
            self,
            ChatError::CredentialMissing
                | ChatError::CredentialInvalid(_)
                | ChatError::CredentialInsufficientScope(_)
                | ChatError::RateLimited { .. }
        )
    }

    /// Short diagnostic shown to the user in place of an answer
    pub fn user_message(&self) -> String {
        match self {
            ChatError::CredentialMissing => "No API key configured".to_string(),
            ChatError::CredentialInvalid(_) => {
                "The API key was rejected. Check the configured key.".to_string()
            }
            ChatError::CredentialInsufficientScope(_) => {
                "The API key does not have access to this model.".to_string()
            }
            ChatError::RateLimited { .. } => {
                "The service is rate limiting requests. Try again shortly.".to_string()
            }
            ChatError::TransientNetworkFailure(_) => {
                "Network error while contacting the service.".to_string()
            }
            ChatError::Timeout(_) => "The request timed out.".to_string(),
            other => format!("Request failed: {}", other),
        }
    }
}

/// Result type alias for chat operations
pub type ChatResult<T> = Result<T, ChatError>;
