//! Conversation history and its persisted form

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ChatResult;
use crate::llm::{ChatRole, ChatTurn};

const FORMAT_VERSION: u32 = 1;

/// Ordered turns of one conversation
///
/// The system turn is held separately and injected fresh on every load; it is
/// never persisted. User and assistant turns alternate: pushing a duplicate of the
/// last turn is a no-op, and a dangling turn of the same role (left behind by a
/// failed call) is replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationHistory {
    conversation_id: String,
    system: Option<ChatTurn>,
    turns: Vec<ChatTurn>,
}

/// Serialized form written to the conversation store
#[derive(Debug, Serialize, Deserialize)]
struct StoredConversation {
    version: u32,
    conversation_id: String,
    updated_at: DateTime<Utc>,
    turns: Vec<ChatTurn>,
}

impl ConversationHistory {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            system: None,
            turns: Vec::new(),
        }
    }

    /// Set (or clear) the system prompt; blank prompts are ignored
    pub fn with_system_prompt(mut self, prompt: Option<&str>) -> Self {
        self.system = prompt
            .filter(|p| !p.trim().is_empty())
            .map(ChatTurn::system);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system.as_ref().map(|t| t.content.as_str())
    }

    /// User and assistant turns in order
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Turns to send to the model: system first when present
    pub fn transcript(&self) -> Vec<ChatTurn> {
        self.system
            .iter()
            .cloned()
            .chain(self.turns.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a user turn; returns false if it was a duplicate
    pub fn push_user(&mut self, content: impl Into<String>) -> bool {
        self.push(ChatTurn::user(content))
    }

    /// Append an assistant turn; returns false if it was a duplicate
    pub fn push_assistant(&mut self, content: impl Into<String>) -> bool {
        self.push(ChatTurn::assistant(content))
    }

    fn push(&mut self, turn: ChatTurn) -> bool {
        match self.turns.last() {
            Some(last) if *last == turn => {
                tracing::debug!(
                    "[History] Ignoring duplicate {} turn in {}",
                    turn.role.as_str(),
                    self.conversation_id
                );
                false
            }
            Some(last) if last.role == turn.role => {
                tracing::debug!(
                    "[History] Replacing dangling {} turn in {}",
                    turn.role.as_str(),
                    self.conversation_id
                );
                if let Some(slot) = self.turns.last_mut() {
                    *slot = turn;
                }
                true
            }
            _ => {
                self.turns.push(turn);
                true
            }
        }
    }

    /// Serialize user and assistant turns
    pub fn to_json(&self) -> ChatResult<String> {
        let stored = StoredConversation {
            version: FORMAT_VERSION,
            conversation_id: self.conversation_id.clone(),
            updated_at: Utc::now(),
            turns: self.turns.clone(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    /// Rebuild from the serialized form, injecting the given system prompt
    ///
    /// Accepts the current envelope or a bare array of turns; stored system
    /// turns are dropped.
    pub fn from_json(
        conversation_id: &str,
        serialized: &str,
        system_prompt: Option<&str>,
    ) -> ChatResult<Self> {
        let turns = match serde_json::from_str::<StoredConversation>(serialized) {
            Ok(stored) => stored.turns,
            Err(_) => serde_json::from_str::<Vec<ChatTurn>>(serialized)?,
        };

        let mut history = Self::new(conversation_id).with_system_prompt(system_prompt);
        for turn in turns.into_iter().filter(|t| t.role != ChatRole::System) {
            history.push(turn);
        }
        Ok(history)
    }
}
