//! Remote chat-completion client
//!
//! - `credentials` - API key resolution, masking, validation
//! - `request` - payload building for both wire shapes
//! - `stream` - SSE decoding
//! - `transport` - HTTP with retry/backoff
//! - `models` - model selection and the shared model handle
//! - `provider` / `service` - the SDK-mediated chat path

pub mod credentials;
pub mod models;
pub mod provider;
pub mod request;
pub mod service;
pub mod stream;
pub mod transport;
pub mod types;

pub use credentials::{
    mask_secret, redact_secrets, validate_credential, Credential, CredentialHandle,
    CredentialResolver, CredentialSource, EnvScope, EnvironmentSource, JsonSecretStore,
    SecretStore, StaticEnvironment, SystemEnvironment, ValidationOutcome, ValidationReport,
};
pub use models::{choose_from, ModelDiscovery, ModelHandle, ModelSelector};
pub use provider::{ChatCompletionService, ChatReply, ChatRequest};
pub use request::{is_reasoning_model, parse_completion, RequestBuilder, RequestPayload};
pub use service::OpenAiCompatibleService;
pub use stream::{decode_stream, DecoderState, StreamDecoder};
pub use transport::{RetryPolicy, Transport};
pub use types::{
    ChatRole, ChatTurn, Completion, FragmentSink, PromptItem, RemoteModelDescriptor,
    StreamFragment, ToolCallRequest,
};
