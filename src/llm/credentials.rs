//! API key resolution, masking and validation
//!
//! The key is resolved once per process from a prioritized list of sources and
//! shared through a cloneable [`CredentialHandle`]:
//!
//! 1. A development secrets file (JSON, flat `"XAI:ApiKey"` keys or nested objects)
//! 2. Environment variables, hierarchical names first (`XAI__API_KEY`), scanned
//!    machine scope, then user scope, then process scope; then the legacy
//!    single-separator names (`XAI_API_KEY`) in the same scope order
//! 3. The static key from configuration
//!
//! ```ignore
//! let resolver = CredentialResolver::new("XAI")
//!     .with_secret_store(Arc::new(JsonSecretStore::new("secrets.json")))
//!     .with_config_key(config.api_key.clone());
//! let credential = CredentialHandle::resolve(resolver);
//! println!("using key {}", credential.current().await.masked());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::ChatError;

use super::transport::Transport;

/// Keys shorter than this are treated as placeholders
const MIN_KEY_LEN: usize = 20;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
          \$\{[^}]*\}              # ${VAR}
        | \{\{[^}]*\}\}            # {{ var }}
        | <[^>]*>                  # <your key>
        | your[-_\s]?api[-_\s]?key
        | replace[-_\s]?me
        | changeme
        ",
    )
    .expect("placeholder regex should compile")
});

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
          xai-[A-Za-z0-9]{16,}          # xAI keys
        | sk-[A-Za-z0-9_\-]{16,}        # OpenAI-style keys
        | Bearer\s+[A-Za-z0-9._\-]{16,} # echoed auth headers
        ",
    )
    .expect("redaction regex should compile")
});

// ============================================================================
// Credential
// ============================================================================

/// Where a credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    UserSecretStore,
    EnvironmentProcess,
    EnvironmentUser,
    EnvironmentMachine,
    ConfigFile,
    None,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialSource::UserSecretStore => "user-secret-store",
            CredentialSource::EnvironmentProcess => "environment-scoped-process",
            CredentialSource::EnvironmentUser => "environment-scoped-user",
            CredentialSource::EnvironmentMachine => "environment-scoped-machine",
            CredentialSource::ConfigFile => "config-file",
            CredentialSource::None => "none",
        };
        f.write_str(name)
    }
}

/// A resolved API key. `Debug` never prints the secret.
#[derive(Clone)]
pub struct Credential {
    secret: Option<String>,
    pub source: CredentialSource,
    pub validated: bool,
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential from a known source
    pub fn new(secret: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            secret: Some(secret.into()),
            source,
            validated: false,
            last_validated_at: None,
        }
    }

    /// No key found anywhere
    pub fn none() -> Self {
        Self {
            secret: None,
            source: CredentialSource::None,
            validated: false,
            last_validated_at: None,
        }
    }

    /// The raw secret, for building the Authorization header only
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn is_present(&self) -> bool {
        self.secret.is_some()
    }

    /// Display form: first 4 and last 4 characters
    pub fn masked(&self) -> String {
        match &self.secret {
            Some(secret) => mask_secret(secret),
            None => "(none)".to_string(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &self.masked())
            .field("source", &self.source)
            .field("validated", &self.validated)
            .field("last_validated_at", &self.last_validated_at)
            .finish()
    }
}

/// Mask a secret down to its first and last four characters
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Replace anything that looks like an API key with `[REDACTED]`
pub fn redact_secrets(input: &str) -> String {
    SECRET_PATTERN.replace_all(input, "[REDACTED]").into_owned()
}

fn is_usable_key(value: &str) -> bool {
    let value = value.trim();
    value.len() >= MIN_KEY_LEN && !PLACEHOLDER.is_match(value)
}

// ============================================================================
// Sources
// ============================================================================

/// A development secret store
pub trait SecretStore: Send + Sync {
    /// Look up a secret by its hierarchical key (`"XAI:ApiKey"`)
    fn get(&self, key: &str) -> Option<String>;
}

/// Secrets read from a JSON file; nested objects are flattened with `:`
pub struct JsonSecretStore {
    path: PathBuf,
}

impl JsonSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> HashMap<String, String> {
        let mut secrets = HashMap::new();
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return secrets,
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(value) => flatten_secrets("", &value, &mut secrets),
            Err(e) => tracing::warn!(
                "[Credentials] Ignoring unreadable secrets file {}: {}",
                self.path.display(),
                e
            ),
        }
        secrets
    }
}

fn flatten_secrets(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let full = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}:{}", prefix, key)
                };
                flatten_secrets(&full, child, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_ascii_lowercase(), s.clone());
        }
        _ => {}
    }
}

impl SecretStore for JsonSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.load().remove(&key.to_ascii_lowercase())
    }
}

/// Scope of an environment variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvScope {
    Machine,
    User,
    Process,
}

impl EnvScope {
    /// Scan order: machine first
    pub const SCAN_ORDER: [EnvScope; 3] = [EnvScope::Machine, EnvScope::User, EnvScope::Process];

    fn source(&self) -> CredentialSource {
        match self {
            EnvScope::Machine => CredentialSource::EnvironmentMachine,
            EnvScope::User => CredentialSource::EnvironmentUser,
            EnvScope::Process => CredentialSource::EnvironmentProcess,
        }
    }
}

/// Scoped environment variable lookup
pub trait EnvironmentSource: Send + Sync {
    fn var(&self, scope: EnvScope, name: &str) -> Option<String>;
}

/// The real process environment. Machine and user scopes are registry concepts
/// that the process inherits, so only the process scope is consulted.
pub struct SystemEnvironment;

impl EnvironmentSource for SystemEnvironment {
    fn var(&self, scope: EnvScope, name: &str) -> Option<String> {
        match scope {
            EnvScope::Process => std::env::var(name).ok(),
            EnvScope::User | EnvScope::Machine => None,
        }
    }
}

/// Fixed set of scoped variables, for embedding hosts and tests
#[derive(Default, Clone)]
pub struct StaticEnvironment {
    vars: HashMap<(EnvScope, String), String>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, scope: EnvScope, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert((scope, name.into()), value.into());
        self
    }
}

impl EnvironmentSource for StaticEnvironment {
    fn var(&self, scope: EnvScope, name: &str) -> Option<String> {
        self.vars.get(&(scope, name.to_string())).cloned()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Scans credential sources in priority order
pub struct CredentialResolver {
    prefix: String,
    secret_store: Option<Arc<dyn SecretStore>>,
    environment: Arc<dyn EnvironmentSource>,
    config_key: Option<String>,
}

impl CredentialResolver {
    /// Create a resolver for a key prefix (`"XAI"` → `XAI__API_KEY`, `XAI_API_KEY`)
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            secret_store: None,
            environment: Arc::new(SystemEnvironment),
            config_key: None,
        }
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentSource>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_config_key(mut self, key: Option<String>) -> Self {
        self.config_key = key;
        self
    }

    fn hierarchical_names(&self) -> [String; 2] {
        [
            format!("{}__API_KEY", self.prefix),
            format!("{}__APIKEY", self.prefix),
        ]
    }

    fn legacy_names(&self) -> [String; 1] {
        [format!("{}_API_KEY", self.prefix)]
    }

    /// Scan all sources; the first usable value wins
    pub fn resolve(&self) -> Credential {
        if let Some(store) = &self.secret_store {
            for key in [format!("{}:ApiKey", self.prefix), format!("{}:API_KEY", self.prefix)] {
                if let Some(value) = store.get(&key) {
                    if let Some(credential) =
                        Self::accept(&value, CredentialSource::UserSecretStore, &key)
                    {
                        return credential;
                    }
                }
            }
        }

        let names = self
            .hierarchical_names()
            .into_iter()
            .chain(self.legacy_names());
        for name in names {
            for scope in EnvScope::SCAN_ORDER {
                if let Some(value) = self.environment.var(scope, &name) {
                    if let Some(credential) = Self::accept(&value, scope.source(), &name) {
                        return credential;
                    }
                }
            }
        }

        if let Some(value) = &self.config_key {
            if let Some(credential) = Self::accept(value, CredentialSource::ConfigFile, "api_key") {
                return credential;
            }
        }

        tracing::warn!("[Credentials] No API key found in any source");
        Credential::none()
    }

    fn accept(value: &str, source: CredentialSource, name: &str) -> Option<Credential> {
        if value.trim().is_empty() {
            return None;
        }
        if !is_usable_key(value) {
            tracing::warn!(
                "[Credentials] Rejected placeholder-looking value for {} from {}",
                name,
                source
            );
            return None;
        }
        tracing::info!("[Credentials] Using API key from {} ({})", source, name);
        Some(Credential::new(value.trim(), source))
    }
}

// ============================================================================
// Shared handle
// ============================================================================

/// Process-wide credential, resolved once and replaced only by [`rotate`](Self::rotate)
#[derive(Clone)]
pub struct CredentialHandle {
    resolver: Arc<CredentialResolver>,
    current: Arc<RwLock<Credential>>,
}

impl CredentialHandle {
    /// Resolve now and keep the result
    pub fn resolve(resolver: CredentialResolver) -> Self {
        let credential = resolver.resolve();
        Self {
            resolver: Arc::new(resolver),
            current: Arc::new(RwLock::new(credential)),
        }
    }

    /// Snapshot of the current credential
    pub async fn current(&self) -> Credential {
        self.current.read().await.clone()
    }

    /// Re-scan all sources and replace the current credential
    pub async fn rotate(&self) -> Credential {
        let credential = self.resolver.resolve();
        let mut guard = self.current.write().await;
        *guard = credential.clone();
        tracing::info!(
            "[Credentials] Rotated credential, now {} from {}",
            credential.masked(),
            credential.source
        );
        credential
    }

    async fn record_validation(&self, success: bool) {
        let mut guard = self.current.write().await;
        guard.validated = success;
        guard.last_validated_at = Some(Utc::now());
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Classified result of a validation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    /// HTTP 401: the key is wrong
    Unauthorized,
    /// HTTP 403: the key is valid but lacks scope
    Forbidden,
    /// HTTP 400: the probe request itself was rejected
    MalformedRequest,
    /// HTTP 429: the key was accepted but the quota is exhausted
    RateLimited,
    /// No key to validate
    Missing,
    /// Network error, timeout or unexpected status
    Unreachable,
}

/// Result of [`validate_credential`]
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub success: bool,
    pub message: String,
    pub outcome: ValidationOutcome,
}

impl ValidationReport {
    fn new(outcome: ValidationOutcome, message: impl Into<String>) -> Self {
        Self {
            success: matches!(outcome, ValidationOutcome::Valid | ValidationOutcome::RateLimited),
            message: message.into(),
            outcome,
        }
    }
}

/// Send one minimal request and classify the answer
///
/// Updates `validated` and `last_validated_at` on the shared credential.
pub async fn validate_credential(
    handle: &CredentialHandle,
    transport: &Transport,
    url: &reqwest::Url,
    probe_body: &Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ValidationReport, ChatError> {
    let credential = handle.current().await;
    let Some(secret) = credential.secret() else {
        return Ok(ValidationReport::new(
            ValidationOutcome::Missing,
            "No API key configured",
        ));
    };

    tracing::info!(
        "[Credentials] Validating key {} against {}",
        credential.masked(),
        url
    );

    let report = match transport.probe(url, secret, probe_body, timeout, cancel).await {
        Ok((status, body)) => classify_validation(status, &body),
        Err(ChatError::Cancelled) => return Err(ChatError::Cancelled),
        Err(ChatError::Timeout(d)) => ValidationReport::new(
            ValidationOutcome::Unreachable,
            format!("Validation timed out after {:?}", d),
        ),
        Err(e) => ValidationReport::new(ValidationOutcome::Unreachable, e.to_string()),
    };

    if report.outcome != ValidationOutcome::Unreachable {
        handle.record_validation(report.success).await;
    }

    tracing::info!(
        "[Credentials] Validation result: {:?} ({})",
        report.outcome,
        report.message
    );
    Ok(report)
}

fn classify_validation(status: u16, body: &str) -> ValidationReport {
    match status {
        200..=299 => {
            let looks_like_completion = serde_json::from_str::<Value>(body)
                .map(|v| v.get("choices").is_some() || v.get("output").is_some() || v.get("id").is_some())
                .unwrap_or(false);
            if looks_like_completion {
                ValidationReport::new(ValidationOutcome::Valid, "API key is valid")
            } else {
                ValidationReport::new(
                    ValidationOutcome::Valid,
                    "API key accepted, but the response shape was unexpected",
                )
            }
        }
        401 => ValidationReport::new(ValidationOutcome::Unauthorized, "API key is invalid (401)"),
        403 => ValidationReport::new(
            ValidationOutcome::Forbidden,
            "API key is valid but lacks permission (403)",
        ),
        400 => ValidationReport::new(
            ValidationOutcome::MalformedRequest,
            format!("Validation request was rejected (400): {}", redact_secrets(body)),
        ),
        429 => ValidationReport::new(
            ValidationOutcome::RateLimited,
            "API key accepted but rate limited (429)",
        ),
        other => ValidationReport::new(
            ValidationOutcome::Unreachable,
            format!("Unexpected status {}", other),
        ),
    }
}
