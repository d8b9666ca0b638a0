//! Conversation history
//!
//! - `ConversationHistory` - ordered turns of one conversation
//! - `ConversationStore` - durable storage contract, with file and in-memory stores
//! - `HistoryManager` - TTL-cached load/save used by the orchestrator

mod history;
mod manager;
mod store;

pub use history::ConversationHistory;
pub use manager::HistoryManager;
pub use store::{
    validate_conversation_id, ConversationStore, ConversationSummary, FileConversationStore,
    InMemoryConversationStore,
};
