pub mod conversation;
pub mod core;
pub mod llm;
pub mod tools;

// Fallback state machine over the llm and conversation layers
pub mod orchestrator;

// Optional components
pub mod cli;
pub mod logging;

pub use crate::core::{ChatConfig, ChatError, ChatResult, WireShape};
pub use orchestrator::{ChatOrchestrator, ChatOutcome, HealthReport, HealthStatus};
