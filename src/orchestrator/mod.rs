//! Conversation orchestration
//!
//! - `state` - fallback states and step outcomes
//! - `orchestrator` - `ChatOrchestrator`, the entry point for chat calls
//! - `health` - health report

mod health;
#[allow(clippy::module_inception)]
mod orchestrator;
mod state;

pub use health::{HealthReport, HealthStatus};
pub use orchestrator::{ChatOrchestrator, ChatOutcome, FragmentStream, OrchestratorBuilder};
pub use state::{ChatPathState, StepOutcome};
