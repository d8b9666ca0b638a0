//! Core types for the chat client
//!
//! - `ChatConfig` / `WireShape` - configuration
//! - `ChatError` - error taxonomy

pub mod config;
pub mod error;

pub use config::{ChatConfig, WireShape};
pub use error::{ChatError, ChatResult};
