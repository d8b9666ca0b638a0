//! Chat completion service trait
//!
//! Abstracts the SDK-mediated chat path so the orchestrator can use any
//! registered implementation (the bundled [`OpenAiCompatibleService`] or one
//! supplied by the host) and fall back to raw HTTP when none is registered.
//!
//! [`OpenAiCompatibleService`]: super::service::OpenAiCompatibleService

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::ChatResult;

use super::types::{ChatTurn, FragmentSink};

/// One chat call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model id to use
    pub model: String,
    /// Full transcript, system turn first when present
    pub turns: Vec<ChatTurn>,
    /// Declare enabled tools and run the tool-invocation loop
    pub use_tools: bool,
    /// Continue a stored response instead of resending the transcript
    pub previous_response_id: Option<String>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, turns: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            turns,
            use_tools: false,
            previous_response_id: None,
        }
    }

    pub fn with_tools(mut self, use_tools: bool) -> Self {
        self.use_tools = use_tools;
        self
    }

    pub fn with_previous_response_id(mut self, id: Option<String>) -> Self {
        self.previous_response_id = id;
        self
    }
}

/// Final answer of a chat call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    /// Complete answer text
    pub text: String,
    /// Id of the last stored response, for continuation
    pub response_id: Option<String>,
    /// Number of tool calls executed while producing the answer
    pub tool_invocations: usize,
}

/// Trait for the SDK-mediated chat path
#[async_trait]
pub trait ChatCompletionService: Send + Sync {
    /// Stream an answer; content fragments go to `sink` as they arrive
    ///
    /// Terminal fragments are not forwarded; the caller signals completion.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatReply>;

    /// Produce a complete answer without streaming
    async fn complete_chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatReply>;

    /// Service name for logging
    fn service_name(&self) -> &str;
}
