//! Chat completion service for OpenAI-compatible endpoints
//!
//! Runs the automatic tool-invocation loop: when the model answers with tool
//! calls, the registry executes them and their outputs are sent back until the
//! model produces a plain answer or the iteration limit is reached.
//!
//! On the Responses shape with server-side storage the loop continues by
//! `previous_response_id` and only sends new items.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::core::{ChatConfig, ChatError, ChatResult, WireShape};
use crate::tools::ToolRegistry;

use super::credentials::CredentialHandle;
use super::provider::{ChatCompletionService, ChatReply, ChatRequest};
use super::request::{parse_completion, RequestBuilder};
use super::transport::Transport;
use super::types::{ChatRole, ChatTurn, Completion, FragmentSink, PromptItem, StreamFragment};

/// Chat service over the shared transport
pub struct OpenAiCompatibleService {
    transport: Transport,
    credential: CredentialHandle,
    builder: RequestBuilder,
    url: Url,
    tools: Arc<ToolRegistry>,
    max_tool_iterations: usize,
}

impl OpenAiCompatibleService {
    pub fn new(
        config: &ChatConfig,
        transport: Transport,
        credential: CredentialHandle,
        tools: Arc<ToolRegistry>,
    ) -> ChatResult<Self> {
        let builder = RequestBuilder::from_config(config);
        let url = config.url_for(builder.wire_shape().path_suffix())?;
        Ok(Self {
            transport,
            credential,
            builder,
            url,
            tools,
            max_tool_iterations: config.max_tool_iterations,
        })
    }

    fn continues_by_id(&self) -> bool {
        self.builder.wire_shape() == WireShape::Responses && self.builder.stores_responses()
    }

    async fn run(
        &self,
        request: &ChatRequest,
        mut sink: Option<FragmentSink<'_>>,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatReply> {
        let credential = self.credential.current().await;
        let secret = credential.secret().ok_or(ChatError::CredentialMissing)?;

        let declarations = if request.use_tools {
            self.tools.declarations()
        } else {
            Vec::new()
        };

        let mut previous = request
            .previous_response_id
            .clone()
            .filter(|_| self.continues_by_id());
        let mut items = match previous {
            Some(_) => continuation_items(&request.turns),
            None => PromptItem::from_turns(&request.turns),
        };
        let mut reply = ChatReply::default();

        for iteration in 0..=self.max_tool_iterations {
            let body = self
                .builder
                .build(&request.model, &items, sink.is_some(), &declarations)
                .with_previous_response_id(previous.as_deref())
                .to_value()?;

            let completion = match sink.as_mut() {
                Some(sink) => {
                    let mut forward = |fragment: StreamFragment| {
                        if !fragment.is_terminal {
                            sink(fragment);
                        }
                    };
                    self.transport
                        .post_stream(&self.url, secret, &body, &mut forward, cancel)
                        .await?
                }
                None => {
                    let value = self
                        .transport
                        .post_json(&self.url, secret, &body, cancel)
                        .await?;
                    parse_completion(&value)?
                }
            };

            let Completion {
                text,
                tool_calls,
                response_id,
            } = completion;
            reply.text.push_str(&text);
            if response_id.is_some() {
                reply.response_id = response_id.clone();
            }

            if tool_calls.is_empty() {
                return Ok(reply);
            }
            if iteration == self.max_tool_iterations {
                tracing::warn!(
                    "[ChatService] Tool iteration limit ({}) reached, returning partial answer",
                    self.max_tool_iterations
                );
                break;
            }

            tracing::info!(
                "[ChatService] Model requested {} tool call(s) (iteration {})",
                tool_calls.len(),
                iteration + 1
            );

            let mut outputs = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                let result = self.tools.invoke(call).await;
                outputs.push(PromptItem::ToolOutput {
                    call_id: call.id.clone(),
                    output: result.output,
                });
                reply.tool_invocations += 1;
            }

            match response_id.filter(|_| self.continues_by_id()) {
                Some(id) => {
                    previous = Some(id);
                    items.clear();
                }
                None => {
                    previous = None;
                    items.push(PromptItem::ToolCalls(tool_calls));
                }
            }
            items.extend(outputs);
        }

        Ok(reply)
    }
}

/// System turn (if any) and the newest turn; earlier turns live server-side
fn continuation_items(turns: &[ChatTurn]) -> Vec<PromptItem> {
    let mut items = Vec::new();
    if let Some(system) = turns.first().filter(|t| t.role == ChatRole::System) {
        items.push(PromptItem::Turn(system.clone()));
    }
    if let Some(last) = turns.last().filter(|t| t.role != ChatRole::System) {
        items.push(PromptItem::Turn(last.clone()));
    }
    items
}

#[async_trait]
impl ChatCompletionService for OpenAiCompatibleService {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatReply> {
        tracing::info!(
            "[ChatService] Streaming chat with {} ({} turns)",
            request.model,
            request.turns.len()
        );
        self.run(request, Some(sink), cancel).await
    }

    async fn complete_chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ChatResult<ChatReply> {
        tracing::info!(
            "[ChatService] Non-streaming chat with {} ({} turns, tools: {})",
            request.model,
            request.turns.len(),
            request.use_tools
        );
        self.run(request, None, cancel).await
    }

    fn service_name(&self) -> &str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_items() {
        let turns = vec![
            ChatTurn::system("sys"),
            ChatTurn::user("first"),
            ChatTurn::assistant("answer"),
            ChatTurn::user("second"),
        ];
        let items = continuation_items(&turns);
        assert_eq!(
            items,
            vec![
                PromptItem::Turn(ChatTurn::system("sys")),
                PromptItem::Turn(ChatTurn::user("second")),
            ]
        );

        let items = continuation_items(&[ChatTurn::user("only")]);
        assert_eq!(items, vec![PromptItem::Turn(ChatTurn::user("only"))]);
    }
}
