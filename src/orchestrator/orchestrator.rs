//! Chat orchestrator
//!
//! Turns one prompt into one answer by walking the fallback sequence in
//! [`ChatPathState::plan`]. Each state either completes the call, falls through
//! to the next state or surfaces an error. Only cancellation and configuration
//! errors come back as `Err`; every other failure becomes a short diagnostic
//! returned as the call's text.
//!
//! On success the user and assistant turns are appended to the conversation and
//! persisted through the [`HistoryManager`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use reqwest::Url;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::{
    ConversationHistory, ConversationStore, HistoryManager, InMemoryConversationStore,
};
use crate::core::{ChatConfig, ChatError, ChatResult, WireShape};
use crate::llm::{
    parse_completion, ChatCompletionService, ChatReply, ChatRequest, ChatTurn, CredentialHandle,
    CredentialResolver, EnvironmentSource, FragmentSink, JsonSecretStore, ModelDiscovery,
    ModelHandle, ModelSelector, OpenAiCompatibleService, PromptItem, RequestBuilder,
    StreamFragment, SystemEnvironment, Transport, ValidationReport,
};
use crate::tools::ToolRegistry;

use super::health::{assess_remote, HealthReport, HealthStatus};
use super::state::{ChatPathState, StepOutcome};

/// Fragments of one streamed call
pub type FragmentStream = Pin<Box<dyn Stream<Item = StreamFragment> + Send>>;

/// Result of one [`ChatOrchestrator::ask`]
#[derive(Debug)]
pub struct ChatOutcome {
    /// Answer text, or a diagnostic when `error` is set
    pub text: String,
    pub conversation_id: String,
    /// State that produced the answer
    pub state: Option<ChatPathState>,
    /// States tried, in order
    pub attempted: Vec<ChatPathState>,
    /// Failure that replaced (or cut short) the answer
    pub error: Option<ChatError>,
    pub response_id: Option<String>,
}

impl ChatOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Fragments handed to the caller so far
#[derive(Default)]
struct Delivery {
    fragments: usize,
    text: String,
}

/// Per-call inputs shared by every state
struct CallContext<'a> {
    model: &'a str,
    transcript: &'a [ChatTurn],
    previous_response_id: Option<&'a str>,
    secret: &'a str,
}

impl CallContext<'_> {
    fn sdk_request(&self, use_tools: bool) -> ChatRequest {
        ChatRequest::new(self.model, self.transcript.to_vec())
            .with_tools(use_tools)
            .with_previous_response_id(self.previous_response_id.map(str::to_string))
    }
}

// ============================================================================
// Builder
// ============================================================================

enum ServiceChoice {
    Bundled,
    Custom(Arc<dyn ChatCompletionService>),
    Unregistered,
}

/// Assembles a [`ChatOrchestrator`] from configuration and optional collaborators
pub struct OrchestratorBuilder {
    config: ChatConfig,
    credential: Option<CredentialHandle>,
    environment: Option<Arc<dyn EnvironmentSource>>,
    store: Option<Arc<dyn ConversationStore>>,
    tools: Option<ToolRegistry>,
    service: ServiceChoice,
    discovery: Option<Arc<dyn ModelDiscovery>>,
    transport: Option<Transport>,
}

impl OrchestratorBuilder {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            credential: None,
            environment: None,
            store: None,
            tools: None,
            service: ServiceChoice::Bundled,
            discovery: None,
            transport: None,
        }
    }

    /// Use an already resolved credential instead of scanning the sources
    pub fn with_credential(mut self, credential: CredentialHandle) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Environment scanned for the API key
    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentSource>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Durable conversation store (in-memory by default)
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Tool registry; build it with [`ToolRegistry::from_config`] to honor the
    /// configured categories and keywords
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Replace the bundled chat service
    pub fn with_chat_service(mut self, service: Arc<dyn ChatCompletionService>) -> Self {
        self.service = ServiceChoice::Custom(service);
        self
    }

    /// Leave the SDK path without a service; its states fall through to HTTP
    pub fn without_chat_service(mut self) -> Self {
        self.service = ServiceChoice::Unregistered;
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ModelDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> ChatResult<ChatOrchestrator> {
        let config = self.config;
        let builder = RequestBuilder::from_config(&config);
        let chat_url = config.url_for(builder.wire_shape().path_suffix())?;
        let models_url = config.url_for("models")?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Transport::from_config(&config)?,
        };

        let credential = match self.credential {
            Some(credential) => credential,
            None => {
                let environment = self
                    .environment
                    .unwrap_or_else(|| Arc::new(SystemEnvironment) as Arc<dyn EnvironmentSource>);
                let mut resolver = CredentialResolver::new(config.key_env_prefix.clone())
                    .with_environment(environment)
                    .with_config_key(config.api_key.clone());
                if let Some(path) = &config.secrets_file {
                    resolver = resolver.with_secret_store(Arc::new(JsonSecretStore::new(path.clone())));
                }
                CredentialHandle::resolve(resolver)
            }
        };

        let tools = Arc::new(
            self.tools
                .unwrap_or_else(|| ToolRegistry::from_config(&config)),
        );

        let service: Option<Arc<dyn ChatCompletionService>> = if !config.sdk_enabled {
            None
        } else {
            match self.service {
                ServiceChoice::Bundled => {
                    let service = OpenAiCompatibleService::new(
                        &config,
                        transport.clone(),
                        credential.clone(),
                        tools.clone(),
                    )?;
                    Some(Arc::new(service) as Arc<dyn ChatCompletionService>)
                }
                ServiceChoice::Custom(service) => Some(service),
                ServiceChoice::Unregistered => None,
            }
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryConversationStore::new()) as Arc<dyn ConversationStore>);
        let history = HistoryManager::new(store).with_ttl(config.history_cache_ttl());

        let mut selector = ModelSelector::new(transport.clone(), credential.clone(), models_url)
            .with_timeout(config.discovery_timeout());
        if let Some(discovery) = self.discovery {
            selector = selector.with_discovery(discovery);
        }

        tracing::info!(
            "[Orchestrator] Ready: model {}, endpoint {}, chat service: {}, tools: {}",
            config.model,
            chat_url,
            service.as_ref().map(|s| s.service_name()).unwrap_or("none"),
            tools.len()
        );

        Ok(ChatOrchestrator {
            model: ModelHandle::new(config.model.clone()),
            builder,
            chat_url,
            transport,
            credential,
            selector,
            tools,
            service,
            history,
            response_ids: RwLock::new(HashMap::new()),
            config,
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Entry point for chat calls
pub struct ChatOrchestrator {
    config: ChatConfig,
    builder: RequestBuilder,
    chat_url: Url,
    transport: Transport,
    credential: CredentialHandle,
    model: ModelHandle,
    selector: ModelSelector,
    tools: Arc<ToolRegistry>,
    service: Option<Arc<dyn ChatCompletionService>>,
    history: HistoryManager,
    response_ids: RwLock<HashMap<String, String>>,
}

impl ChatOrchestrator {
    pub fn builder(config: ChatConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn credential(&self) -> &CredentialHandle {
        &self.credential
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn has_chat_service(&self) -> bool {
        self.service.is_some()
    }

    /// Pick the model for this process when auto-selection is enabled
    ///
    /// Returns the model now in use. Discovery failures keep the configured one.
    pub async fn initialize_model(&self, cancel: &CancellationToken) -> String {
        let configured = self.model.current().await;
        if !self.config.auto_select_model {
            return configured;
        }
        if !self.credential.current().await.is_present() {
            tracing::debug!("[Orchestrator] No API key, skipping model discovery");
            return configured;
        }

        match self.selector.select_best_model(&configured, cancel).await {
            Some(best) => {
                if best != configured {
                    self.model.set_model(best.clone()).await;
                }
                best
            }
            None => configured,
        }
    }

    /// Check the current key with one minimal request
    pub async fn validate_credential(
        &self,
        cancel: &CancellationToken,
    ) -> ChatResult<ValidationReport> {
        let model = self.model.current().await;
        let items = [PromptItem::Turn(ChatTurn::user("ping"))];
        let probe = self.builder.build(&model, &items, false, &[]).to_value()?;
        crate::llm::validate_credential(
            &self.credential,
            &self.transport,
            &self.chat_url,
            &probe,
            self.config.validation_timeout(),
            cancel,
        )
        .await
    }

    /// Liveness of the credential, the conversation store and the remote service
    pub async fn health_check(&self, cancel: &CancellationToken) -> HealthReport {
        let credential = self.credential.current().await;
        let model = self.model.current().await;
        let report = |status: HealthStatus, reason: String| {
            HealthReport::new(status, reason, &credential, model.clone())
        };

        if !credential.is_present() {
            return report(
                HealthStatus::Unhealthy,
                ChatError::CredentialMissing.user_message(),
            );
        }

        if let Err(e) = self.history.store().get_conversations_page(0, 1).await {
            tracing::warn!("[Orchestrator] Conversation store probe failed: {}", e);
            return report(
                HealthStatus::Degraded,
                format!("Conversation store unavailable: {}", e),
            );
        }

        let deadline = self.config.discovery_timeout();
        let listing = match tokio::time::timeout(deadline, self.selector.list_models(cancel)).await
        {
            Ok(result) => result.map(|m| m.len()),
            Err(_) => Err(ChatError::Timeout(deadline)),
        };
        let service_missing = self.config.sdk_enabled && self.service.is_none();
        let (status, reason) = assess_remote(&listing, service_missing);
        tracing::info!("[Orchestrator] Health: {:?} ({})", status, reason);
        report(status, reason)
    }

    /// Answer `prompt`, streaming fragments into `sink`
    ///
    /// A fresh conversation id is generated when none is given. Exactly one
    /// terminal fragment is emitted at the end of every call that returns `Ok`.
    pub async fn ask(
        &self,
        prompt: &str,
        conversation_id: Option<&str>,
        system_prompt: Option<&str>,
        sink: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatOutcome> {
        let conversation_id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }

        let credential = self.credential.current().await;
        let Some(secret) = credential.secret().map(str::to_string) else {
            tracing::warn!("[Orchestrator] No API key configured, not calling the remote service");
            return Ok(diagnostic(conversation_id, Vec::new(), ChatError::CredentialMissing, sink));
        };

        let mut history = match self.history.load(&conversation_id, system_prompt).await {
            Ok(history) => history,
            Err(e) if e.is_hard_failure() => return Err(e),
            Err(e) => {
                tracing::error!("[Orchestrator] Failed to load {}: {}", conversation_id, e);
                return Ok(diagnostic(conversation_id, Vec::new(), e, sink));
            }
        };
        history.push_user(prompt);
        let transcript = history.transcript();

        let model = self.model.current().await;
        let previous = self.response_ids.read().await.get(&conversation_id).cloned();
        let call = CallContext {
            model: &model,
            transcript: &transcript,
            previous_response_id: previous.as_deref(),
            secret: &secret,
        };

        let plan = ChatPathState::plan(self.config.sdk_enabled, self.tools.is_tool_heavy(prompt));
        tracing::info!(
            "[Orchestrator] Ask in {} with {} ({} turns), plan: {:?}",
            conversation_id,
            model,
            transcript.len(),
            plan
        );

        let mut attempted = Vec::with_capacity(plan.len());
        let mut delivery = Delivery::default();
        let mut failure = None;

        for state in plan {
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            attempted.push(state);

            let result = {
                let mut forward = |fragment: StreamFragment| {
                    if fragment.is_terminal {
                        return;
                    }
                    if !fragment.is_tool_call {
                        delivery.text.push_str(&fragment.text);
                    }
                    delivery.fragments += 1;
                    sink(fragment);
                };
                self.run_state(state, &call, &mut forward, cancel).await
            };

            let step = match result {
                Ok(reply) if reply.text.trim().is_empty() => StepOutcome::from_error(
                    ChatError::malformed(format!("{} returned an empty answer", state), ""),
                    delivery.fragments,
                ),
                Ok(reply) => StepOutcome::Completed(reply),
                Err(e) => StepOutcome::from_error(e, delivery.fragments),
            };

            match step {
                StepOutcome::Completed(reply) => {
                    if !state.is_streaming() {
                        sink(StreamFragment::content(reply.text.clone()));
                    }
                    sink(StreamFragment::terminal());
                    return Ok(self.complete(history, state, attempted, reply).await);
                }
                StepOutcome::FallThrough(e) => {
                    tracing::warn!("[Orchestrator] {} failed, falling through: {}", state, e);
                    failure = Some(e);
                }
                StepOutcome::Surface(e) => {
                    tracing::error!("[Orchestrator] {} failed: {}", state, e);
                    failure = Some(e);
                    break;
                }
            }
        }

        let error = failure
            .unwrap_or_else(|| ChatError::ServiceUnavailable("no chat path available".to_string()));
        if error.is_hard_failure() {
            return Err(error);
        }

        if !delivery.text.trim().is_empty() {
            tracing::warn!(
                "[Orchestrator] Keeping {} chars of partial answer",
                delivery.text.len()
            );
            history.push_assistant(delivery.text.clone());
            self.persist(&history).await;
            // The server never stored this exchange; continue from the full transcript next time
            self.response_ids.write().await.remove(&conversation_id);
            sink(StreamFragment::terminal());
            return Ok(ChatOutcome {
                text: delivery.text,
                conversation_id,
                state: attempted.last().copied(),
                attempted,
                error: Some(error),
                response_id: None,
            });
        }

        Ok(diagnostic(conversation_id, attempted, error, sink))
    }

    /// Run [`ask`](Self::ask) on a spawned task and expose its fragments as a stream
    ///
    /// The stream ends after the terminal fragment; the join handle yields the
    /// call's outcome.
    pub fn ask_stream(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        conversation_id: Option<String>,
        system_prompt: Option<String>,
        cancel: CancellationToken,
    ) -> (FragmentStream, JoinHandle<ChatResult<ChatOutcome>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::clone(self);
        let prompt = prompt.into();

        let handle = tokio::spawn(async move {
            let mut forward = move |fragment: StreamFragment| {
                let _ = tx.send(fragment);
            };
            orchestrator
                .ask(
                    &prompt,
                    conversation_id.as_deref(),
                    system_prompt.as_deref(),
                    &mut forward,
                    &cancel,
                )
                .await
        });

        let stream = async_stream::stream! {
            while let Some(fragment) = rx.recv().await {
                yield fragment;
            }
        };
        (Box::pin(stream), handle)
    }

    async fn run_state(
        &self,
        state: ChatPathState,
        call: &CallContext<'_>,
        sink: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatReply> {
        match state {
            ChatPathState::SdkStreaming => {
                let service = self.chat_service()?;
                let request = call.sdk_request(self.tools.has_enabled_tools());
                service.stream_chat(&request, sink, cancel).await
            }
            ChatPathState::SdkNonStreamingForTools => {
                let service = self.chat_service()?;
                service.complete_chat(&call.sdk_request(true), cancel).await
            }
            ChatPathState::HttpStreamingFallback => {
                let items = PromptItem::from_turns(call.transcript);
                let body = self.builder.build(call.model, &items, true, &[]).to_value()?;
                let completion = self
                    .transport
                    .post_stream(&self.chat_url, call.secret, &body, sink, cancel)
                    .await?;
                Ok(ChatReply {
                    text: completion.text,
                    response_id: completion.response_id,
                    tool_invocations: 0,
                })
            }
            ChatPathState::HttpNonStreamingFallback => {
                let items = PromptItem::from_turns(call.transcript);
                let body = self.builder.build(call.model, &items, false, &[]).to_value()?;
                let parsed = self
                    .transport
                    .post_json(&self.chat_url, call.secret, &body, cancel)
                    .await
                    .and_then(|value| parse_completion(&value));
                match parsed {
                    Ok(completion) => Ok(ChatReply {
                        text: completion.text,
                        response_id: completion.response_id,
                        tool_invocations: 0,
                    }),
                    // Last resort: hand back whatever the service said
                    Err(ChatError::MalformedRemoteResponse { reason, body }) => {
                        tracing::warn!(
                            "[Orchestrator] Unrecognized response shape ({}), returning raw body",
                            reason
                        );
                        Ok(ChatReply {
                            text: self.transport.bound(&body),
                            ..ChatReply::default()
                        })
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn chat_service(&self) -> ChatResult<&Arc<dyn ChatCompletionService>> {
        self.service
            .as_ref()
            .ok_or_else(|| ChatError::ServiceUnavailable("no chat service registered".to_string()))
    }

    async fn complete(
        &self,
        mut history: ConversationHistory,
        state: ChatPathState,
        attempted: Vec<ChatPathState>,
        reply: ChatReply,
    ) -> ChatOutcome {
        history.push_assistant(reply.text.clone());
        self.persist(&history).await;

        let conversation_id = history.conversation_id().to_string();
        if self.continues_by_id() {
            let mut ids = self.response_ids.write().await;
            match &reply.response_id {
                Some(id) => {
                    ids.insert(conversation_id.clone(), id.clone());
                }
                None => {
                    ids.remove(&conversation_id);
                }
            }
        }

        tracing::info!(
            "[Orchestrator] Completed {} via {} after {} state(s) ({} chars, {} tool call(s))",
            conversation_id,
            state,
            attempted.len(),
            reply.text.len(),
            reply.tool_invocations
        );

        ChatOutcome {
            text: reply.text,
            conversation_id,
            state: Some(state),
            attempted,
            error: None,
            response_id: reply.response_id,
        }
    }

    fn continues_by_id(&self) -> bool {
        self.builder.wire_shape() == WireShape::Responses && self.builder.stores_responses()
    }

    async fn persist(&self, history: &ConversationHistory) {
        if let Err(e) = self.history.save(history).await {
            tracing::error!(
                "[Orchestrator] Failed to save conversation {}: {}",
                history.conversation_id(),
                e
            );
        }
    }
}

/// Deliver a failure as the call's text; diagnostics are not persisted
fn diagnostic(
    conversation_id: String,
    attempted: Vec<ChatPathState>,
    error: ChatError,
    sink: FragmentSink<'_>,
) -> ChatOutcome {
    let text = error.user_message();
    sink(StreamFragment::content(text.clone()));
    sink(StreamFragment::terminal());
    ChatOutcome {
        text,
        conversation_id,
        state: None,
        attempted,
        error: Some(error),
        response_id: None,
    }
}
