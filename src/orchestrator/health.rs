//! Health report for the hosting application

use chrono::{DateTime, Utc};

use crate::core::{ChatError, ChatResult};
use crate::llm::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Answers are possible but something is off
    Degraded,
    /// No answer can be produced
    Unhealthy,
}

/// Result of [`ChatOrchestrator::health_check`](super::ChatOrchestrator::health_check)
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reason: String,
    /// Masked form of the key, never the secret itself
    pub masked_credential: String,
    pub credential_source: String,
    pub model: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub(crate) fn new(
        status: HealthStatus,
        reason: String,
        credential: &Credential,
        model: String,
    ) -> Self {
        Self {
            status,
            reason,
            masked_credential: credential.masked(),
            credential_source: credential.source.to_string(),
            model,
            checked_at: Utc::now(),
        }
    }
}

/// Classify the model listing probe
///
/// `listing` is the number of models advertised by the remote service.
pub(crate) fn assess_remote(
    listing: &ChatResult<usize>,
    service_missing: bool,
) -> (HealthStatus, String) {
    match listing {
        Ok(0) => (
            HealthStatus::Degraded,
            "Remote service advertises no models".to_string(),
        ),
        Ok(_) if service_missing => (
            HealthStatus::Degraded,
            "Chat service not registered, answers use the HTTP fallback".to_string(),
        ),
        Ok(count) => (
            HealthStatus::Healthy,
            format!("Remote service reachable ({} models)", count),
        ),
        Err(ChatError::RateLimited { .. }) => (
            HealthStatus::Degraded,
            ChatError::RateLimited {
                retries: 0,
                body: String::new(),
            }
            .user_message(),
        ),
        Err(e) if e.is_credential_or_quota() => (HealthStatus::Unhealthy, e.user_message()),
        Err(ChatError::Cancelled) => (
            HealthStatus::Degraded,
            "Health check cancelled".to_string(),
        ),
        Err(e) => (
            HealthStatus::Degraded,
            format!("Remote service unreachable: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CredentialSource;
    use std::time::Duration;

    #[test]
    fn test_assess_remote() {
        assert_eq!(assess_remote(&Ok(3), false).0, HealthStatus::Healthy);
        assert_eq!(assess_remote(&Ok(3), true).0, HealthStatus::Degraded);
        assert_eq!(assess_remote(&Ok(0), false).0, HealthStatus::Degraded);
        assert_eq!(
            assess_remote(&Err(ChatError::CredentialInvalid("401".into())), false).0,
            HealthStatus::Unhealthy
        );
        assert_eq!(
            assess_remote(
                &Err(ChatError::RateLimited {
                    retries: 3,
                    body: String::new()
                }),
                false
            )
            .0,
            HealthStatus::Degraded
        );
        let (status, reason) =
            assess_remote(&Err(ChatError::Timeout(Duration::from_secs(3))), false);
        assert_eq!(status, HealthStatus::Degraded);
        assert!(reason.starts_with("Remote service unreachable"));
    }

    #[test]
    fn test_report_masks_credential() {
        let credential = Credential::new("xai-abcdefghijklmnopqrstuvwxyz", CredentialSource::ConfigFile);
        let report = HealthReport::new(HealthStatus::Healthy, "ok".into(), &credential, "grok-4".into());
        assert_eq!(report.masked_credential, "xai-...wxyz");
        assert!(!report.masked_credential.contains("abcdefgh"));
        assert_eq!(report.credential_source, CredentialSource::ConfigFile.to_string());
    }
}
