//! Fallback states and step outcomes

use std::fmt;

use crate::core::ChatError;
use crate::llm::ChatReply;

/// A code path the orchestrator can try, in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatPathState {
    /// Registered chat service, streamed
    SdkStreaming,
    /// Registered chat service, non-streamed, with tool declarations
    SdkNonStreamingForTools,
    /// Raw HTTP, streamed
    HttpStreamingFallback,
    /// Raw HTTP, non-streamed
    HttpNonStreamingFallback,
}

impl ChatPathState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPathState::SdkStreaming => "sdk-streaming",
            ChatPathState::SdkNonStreamingForTools => "sdk-non-streaming-for-tools",
            ChatPathState::HttpStreamingFallback => "http-streaming-fallback",
            ChatPathState::HttpNonStreamingFallback => "http-non-streaming-fallback",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            ChatPathState::SdkStreaming | ChatPathState::HttpStreamingFallback
        )
    }

    /// States to try for one call, in order
    ///
    /// A tool-heavy prompt tries the non-streaming tool path first and then the
    /// streaming SDK path; the HTTP fallbacks always close the sequence.
    pub fn plan(sdk_enabled: bool, tool_heavy: bool) -> Vec<ChatPathState> {
        let mut states = Vec::with_capacity(4);
        if sdk_enabled {
            if tool_heavy {
                states.push(ChatPathState::SdkNonStreamingForTools);
            }
            states.push(ChatPathState::SdkStreaming);
        }
        states.push(ChatPathState::HttpStreamingFallback);
        states.push(ChatPathState::HttpNonStreamingFallback);
        states
    }
}

impl fmt::Display for ChatPathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one state
#[derive(Debug)]
pub enum StepOutcome {
    /// The state produced the answer
    Completed(ChatReply),
    /// Try the next state
    FallThrough(ChatError),
    /// Stop and report this error
    Surface(ChatError),
}

impl StepOutcome {
    /// Decide what a failure in a state means for the call
    ///
    /// `delivered` counts fragments already handed to the caller.
    pub fn from_error(error: ChatError, delivered: usize) -> Self {
        if error.is_hard_failure() || error.is_credential_or_quota() || delivered > 0 {
            StepOutcome::Surface(error)
        } else {
            StepOutcome::FallThrough(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_plan_order() {
        use ChatPathState::*;
        assert_eq!(
            ChatPathState::plan(true, true),
            vec![
                SdkNonStreamingForTools,
                SdkStreaming,
                HttpStreamingFallback,
                HttpNonStreamingFallback
            ]
        );
        assert_eq!(
            ChatPathState::plan(true, false),
            vec![SdkStreaming, HttpStreamingFallback, HttpNonStreamingFallback]
        );
        assert_eq!(
            ChatPathState::plan(false, true),
            vec![HttpStreamingFallback, HttpNonStreamingFallback]
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            StepOutcome::from_error(ChatError::Timeout(Duration::from_secs(1)), 0),
            StepOutcome::FallThrough(_)
        ));
        assert!(matches!(
            StepOutcome::from_error(ChatError::Timeout(Duration::from_secs(1)), 3),
            StepOutcome::Surface(_)
        ));
        assert!(matches!(
            StepOutcome::from_error(ChatError::CredentialInvalid("401".into()), 0),
            StepOutcome::Surface(_)
        ));
        assert!(matches!(
            StepOutcome::from_error(ChatError::Cancelled, 0),
            StepOutcome::Surface(_)
        ));
        assert!(matches!(
            StepOutcome::from_error(ChatError::ServiceUnavailable("none".into()), 0),
            StepOutcome::FallThrough(_)
        ));
    }
}
