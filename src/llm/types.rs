//! Shared chat types
//!
//! These are the provider-neutral types that flow between the history manager,
//! the request builder, the decoder and the orchestrator. Wire-level request
//! shapes live in [`request`](super::request).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Conversation turns
// ============================================================================

/// Role of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Tool calls
// ============================================================================

/// A model-initiated request to invoke a declared tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call id assigned by the remote model
    pub id: String,
    /// Tool name
    pub name: String,
    /// Raw JSON arguments as sent by the model
    pub arguments: String,
}

impl ToolCallRequest {
    /// Parse the raw arguments; an empty string means no arguments
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Item of the working transcript sent to the model
///
/// Persisted history only ever contains `Turn` items; tool calls and their
/// outputs exist for the duration of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptItem {
    Turn(ChatTurn),
    ToolCalls(Vec<ToolCallRequest>),
    ToolOutput { call_id: String, output: String },
}

impl PromptItem {
    /// Wrap a slice of turns
    pub fn from_turns(turns: &[ChatTurn]) -> Vec<PromptItem> {
        turns.iter().cloned().map(PromptItem::Turn).collect()
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// A piece of an incrementally delivered answer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFragment {
    /// Content text (possibly empty)
    pub text: String,
    /// Whether this fragment announces a tool call rather than content
    pub is_tool_call: bool,
    /// Set once the stream has ended
    pub is_terminal: bool,
}

impl StreamFragment {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_tool_call: false,
            is_terminal: false,
        }
    }

    /// Fragment announcing a tool call by name
    pub fn tool_call(name: impl Into<String>) -> Self {
        Self {
            text: name.into(),
            is_tool_call: true,
            is_terminal: false,
        }
    }

    pub fn terminal() -> Self {
        Self {
            text: String::new(),
            is_tool_call: false,
            is_terminal: true,
        }
    }
}

/// Callback receiving fragments in arrival order
pub type FragmentSink<'a> = &'a mut (dyn FnMut(StreamFragment) + Send);

/// Complete result of one request (streamed or not)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Accumulated answer text
    pub text: String,
    /// Tool calls requested by the model
    pub tool_calls: Vec<ToolCallRequest>,
    /// Server-side response id (Responses shape only)
    pub response_id: Option<String>,
}

impl Completion {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ============================================================================
// Models
// ============================================================================

/// A model advertised by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteModelDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_serialization() {
        let turn = ChatTurn::user("Hello");
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"Hello"}"#);
    }

    #[test]
    fn test_tool_call_arguments() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "forecast".into(),
            arguments: String::new(),
        };
        assert!(call.parsed_arguments().unwrap().as_object().unwrap().is_empty());

        let call = ToolCallRequest {
            arguments: r#"{"years": 3}"#.into(),
            ..call
        };
        assert_eq!(call.parsed_arguments().unwrap()["years"], 3);
    }
}
