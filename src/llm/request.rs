//! Request payloads for both wire shapes, and completion parsing
//!
//! The builder translates the provider-neutral [`PromptItem`] transcript into one of
//! two request schemas:
//!
//! - **Legacy chat**: a flat `messages` array posted to `/chat/completions`
//! - **Responses**: an `input` array posted to `/responses`, with a `store` flag and
//!   an optional `previous_response_id` for server-side continuation
//!
//! Tool declarations are borrowed from the registry and serialized as-is.

use serde::Serialize;
use serde_json::Value;

use crate::core::{ChatConfig, ChatError, ChatResult, WireShape};
use crate::tools::ToolDeclaration;

use super::types::{ChatRole, Completion, PromptItem, ToolCallRequest};

/// Whether a model rejects sampling penalties
///
/// Any model whose id contains "reason" (case-insensitive) is a reasoning model.
pub fn is_reasoning_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("reason")
}

// ============================================================================
// Legacy chat shape
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<LegacyTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<LegacyToolCall<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct LegacyToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: LegacyFunctionCall<'a>,
}

#[derive(Debug, Serialize)]
struct LegacyFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Debug, Serialize)]
struct LegacyTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolDeclaration,
}

// ============================================================================
// Responses shape
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<ResponsesItem<'a>>,
    stream: bool,
    store: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ResponsesItem<'a> {
    Message {
        role: &'static str,
        content: &'a str,
    },
    FunctionCall {
        #[serde(rename = "type")]
        kind: &'static str,
        call_id: &'a str,
        name: &'a str,
        arguments: &'a str,
    },
    FunctionCallOutput {
        #[serde(rename = "type")]
        kind: &'static str,
        call_id: &'a str,
        output: &'a str,
    },
}

#[derive(Debug, Serialize)]
struct ResponsesTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    function: &'a ToolDeclaration,
}

// ============================================================================
// Payload
// ============================================================================

/// A request body in one of the two wire shapes
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RequestPayload<'a> {
    Chat(ChatCompletionRequest<'a>),
    Responses(ResponsesRequest<'a>),
}

impl<'a> RequestPayload<'a> {
    /// Continue a stored response (Responses shape only; ignored otherwise)
    pub fn with_previous_response_id(mut self, id: Option<&'a str>) -> Self {
        if let RequestPayload::Responses(request) = &mut self {
            request.previous_response_id = id;
        }
        self
    }

    pub fn model(&self) -> &str {
        match self {
            RequestPayload::Chat(r) => r.model,
            RequestPayload::Responses(r) => r.model,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            RequestPayload::Chat(r) => r.stream,
            RequestPayload::Responses(r) => r.stream,
        }
    }

    pub fn wire_shape(&self) -> WireShape {
        match self {
            RequestPayload::Chat(_) => WireShape::LegacyChat,
            RequestPayload::Responses(_) => WireShape::Responses,
        }
    }

    pub fn to_value(&self) -> ChatResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Builds request payloads from configuration defaults
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    wire_shape: WireShape,
    temperature: Option<f32>,
    presence_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    store: bool,
}

impl RequestBuilder {
    pub fn new(wire_shape: WireShape) -> Self {
        Self {
            wire_shape,
            temperature: None,
            presence_penalty: None,
            frequency_penalty: None,
            store: true,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            wire_shape: config.wire_shape,
            temperature: config.temperature,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
            store: config.store_responses,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_penalties(mut self, presence: Option<f32>, frequency: Option<f32>) -> Self {
        self.presence_penalty = presence;
        self.frequency_penalty = frequency;
        self
    }

    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn wire_shape(&self) -> WireShape {
        self.wire_shape
    }

    pub fn stores_responses(&self) -> bool {
        self.store
    }

    /// Build a payload for `model` from the transcript and enabled tool declarations
    pub fn build<'a>(
        &self,
        model: &'a str,
        items: &'a [PromptItem],
        stream: bool,
        tools: &[&'a ToolDeclaration],
    ) -> RequestPayload<'a> {
        let (presence_penalty, frequency_penalty) = if is_reasoning_model(model) {
            (None, None)
        } else {
            (self.presence_penalty, self.frequency_penalty)
        };
        let tool_choice = if tools.is_empty() { None } else { Some("auto") };

        match self.wire_shape {
            WireShape::LegacyChat => RequestPayload::Chat(ChatCompletionRequest {
                model,
                messages: items.iter().map(legacy_message).collect(),
                stream,
                temperature: self.temperature,
                presence_penalty,
                frequency_penalty,
                tools: (!tools.is_empty()).then(|| {
                    tools
                        .iter()
                        .map(|t| LegacyTool {
                            kind: "function",
                            function: *t,
                        })
                        .collect()
                }),
                tool_choice,
            }),
            WireShape::Responses => RequestPayload::Responses(ResponsesRequest {
                model,
                input: items.iter().flat_map(responses_items).collect(),
                stream,
                store: self.store,
                previous_response_id: None,
                temperature: self.temperature,
                presence_penalty,
                frequency_penalty,
                tools: (!tools.is_empty()).then(|| {
                    tools
                        .iter()
                        .map(|t| ResponsesTool {
                            kind: "function",
                            function: *t,
                        })
                        .collect()
                }),
                tool_choice,
            }),
        }
    }
}

fn legacy_message(item: &PromptItem) -> ChatMessage<'_> {
    match item {
        PromptItem::Turn(turn) => ChatMessage {
            role: turn.role.as_str(),
            content: Some(&turn.content),
            tool_calls: None,
            tool_call_id: None,
        },
        PromptItem::ToolCalls(calls) => ChatMessage {
            role: ChatRole::Assistant.as_str(),
            content: None,
            tool_calls: Some(
                calls
                    .iter()
                    .map(|c| LegacyToolCall {
                        id: &c.id,
                        kind: "function",
                        function: LegacyFunctionCall {
                            name: &c.name,
                            arguments: &c.arguments,
                        },
                    })
                    .collect(),
            ),
            tool_call_id: None,
        },
        PromptItem::ToolOutput { call_id, output } => ChatMessage {
            role: "tool",
            content: Some(output),
            tool_calls: None,
            tool_call_id: Some(call_id),
        },
    }
}

fn responses_items(item: &PromptItem) -> Vec<ResponsesItem<'_>> {
    match item {
        PromptItem::Turn(turn) => vec![ResponsesItem::Message {
            role: turn.role.as_str(),
            content: &turn.content,
        }],
        PromptItem::ToolCalls(calls) => calls
            .iter()
            .map(|c| ResponsesItem::FunctionCall {
                kind: "function_call",
                call_id: &c.id,
                name: &c.name,
                arguments: &c.arguments,
            })
            .collect(),
        PromptItem::ToolOutput { call_id, output } => vec![ResponsesItem::FunctionCallOutput {
            kind: "function_call_output",
            call_id,
            output,
        }],
    }
}

// ============================================================================
// Completion parsing
// ============================================================================

/// Extract text, tool calls and response id from a non-streaming response body
///
/// Recognizes the legacy `choices` shape and the Responses `output` shape.
pub fn parse_completion(body: &Value) -> ChatResult<Completion> {
    if let Some(choices) = body.get("choices") {
        return parse_chat_choices(choices, body);
    }
    if let Some(output) = body.get("output").and_then(Value::as_array) {
        return Ok(parse_responses_output(output, body));
    }
    Err(ChatError::malformed(
        "response has neither 'choices' nor 'output'",
        body.to_string(),
    ))
}

fn parse_chat_choices(choices: &Value, body: &Value) -> ChatResult<Completion> {
    let message = choices
        .get(0)
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ChatError::malformed("no message in first choice", body.to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolCallRequest {
                        id: call.get("id").and_then(Value::as_str)?.to_string(),
                        name: function.get("name").and_then(Value::as_str)?.to_string(),
                        arguments: arguments_string(function.get("arguments")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Completion {
        text,
        tool_calls,
        response_id: None,
    })
}

fn parse_responses_output(output: &[Value], body: &Value) -> Completion {
    let mut completion = Completion {
        response_id: body.get("id").and_then(Value::as_str).map(String::from),
        ..Default::default()
    };

    for item in output {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                let parts = item.get("content").and_then(Value::as_array);
                for part in parts.into_iter().flatten() {
                    if part.get("type").and_then(Value::as_str) == Some("output_text") {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            completion.text.push_str(text);
                        }
                    }
                }
            }
            Some("function_call") => {
                let call_id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str);
                let name = item.get("name").and_then(Value::as_str);
                if let (Some(call_id), Some(name)) = (call_id, name) {
                    completion.tool_calls.push(ToolCallRequest {
                        id: call_id.to_string(),
                        name: name.to_string(),
                        arguments: arguments_string(item.get("arguments")),
                    });
                }
            }
            other => {
                tracing::debug!("[Request] Ignoring output item of type {:?}", other);
            }
        }
    }

    if completion.text.is_empty() {
        if let Some(text) = body.get("output_text").and_then(Value::as_str) {
            completion.text = text.to_string();
        }
    }
    completion
}

/// Arguments arrive either as a JSON string or as an inline object
fn arguments_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatTurn;
    use serde_json::json;

    fn declaration() -> ToolDeclaration {
        ToolDeclaration {
            name: "budget_variance".into(),
            description: "Compute budget variance".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    fn transcript() -> Vec<PromptItem> {
        PromptItem::from_turns(&[ChatTurn::system("be brief"), ChatTurn::user("hi")])
    }

    #[test]
    fn test_reasoning_model_detection() {
        assert!(is_reasoning_model("grok-4-fast-reasoning"));
        assert!(is_reasoning_model("Grok-REASONER"));
        assert!(!is_reasoning_model("grok-4"));
    }

    #[test]
    fn test_reasoning_model_never_gets_penalties() {
        let items = transcript();
        for shape in [WireShape::LegacyChat, WireShape::Responses] {
            let builder = RequestBuilder::new(shape).with_penalties(Some(0.5), Some(0.2));

            let value = builder
                .build("grok-4-fast-reasoning", &items, true, &[])
                .to_value()
                .unwrap();
            assert!(value.get("presence_penalty").is_none());
            assert!(value.get("frequency_penalty").is_none());

            let value = builder.build("grok-4", &items, true, &[]).to_value().unwrap();
            assert_eq!(value["presence_penalty"], json!(0.5));
        }
    }

    #[test]
    fn test_tool_choice_only_with_tools() {
        let items = transcript();
        let decl = declaration();
        for shape in [WireShape::LegacyChat, WireShape::Responses] {
            let builder = RequestBuilder::new(shape);

            let value = builder.build("grok-4", &items, false, &[]).to_value().unwrap();
            assert!(value.get("tool_choice").is_none());
            assert!(value.get("tools").is_none());

            let value = builder
                .build("grok-4", &items, false, &[&decl])
                .to_value()
                .unwrap();
            assert_eq!(value["tool_choice"], "auto");
            assert_eq!(value["tools"].as_array().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_legacy_shape() {
        let items = transcript();
        let decl = declaration();
        let value = RequestBuilder::new(WireShape::LegacyChat)
            .build("grok-4", &items, true, &[&decl])
            .to_value()
            .unwrap();

        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
        assert_eq!(value["stream"], true);
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "budget_variance");
        assert!(value.get("store").is_none());
    }

    #[test]
    fn test_responses_shape() {
        let items = transcript();
        let decl = declaration();
        let payload = RequestBuilder::new(WireShape::Responses)
            .build("grok-4", &items, false, &[&decl])
            .with_previous_response_id(Some("resp_1"));
        let value = payload.to_value().unwrap();

        assert_eq!(value["input"][1]["role"], "user");
        assert_eq!(value["store"], true);
        assert_eq!(value["previous_response_id"], "resp_1");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["name"], "budget_variance");
        assert!(value.get("messages").is_none());
    }

    #[test]
    fn test_tool_round_trip_items() {
        let mut items = transcript();
        items.push(PromptItem::ToolCalls(vec![ToolCallRequest {
            id: "call_1".into(),
            name: "budget_variance".into(),
            arguments: "{}".into(),
        }]));
        items.push(PromptItem::ToolOutput {
            call_id: "call_1".into(),
            output: "42".into(),
        });

        let legacy = RequestBuilder::new(WireShape::LegacyChat)
            .build("grok-4", &items, false, &[])
            .to_value()
            .unwrap();
        assert_eq!(legacy["messages"][2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(legacy["messages"][3]["role"], "tool");
        assert_eq!(legacy["messages"][3]["tool_call_id"], "call_1");

        let responses = RequestBuilder::new(WireShape::Responses)
            .build("grok-4", &items, false, &[])
            .to_value()
            .unwrap();
        assert_eq!(responses["input"][2]["type"], "function_call");
        assert_eq!(responses["input"][3]["type"], "function_call_output");
        assert_eq!(responses["input"][3]["output"], "42");
    }

    #[test]
    fn test_parse_chat_completion() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "forecast", "arguments": "{\"years\":2}"}
                    }]
                }
            }]
        });
        let completion = parse_completion(&body).unwrap();
        assert!(completion.text.is_empty());
        assert_eq!(completion.tool_calls[0].name, "forecast");
        assert_eq!(completion.tool_calls[0].parsed_arguments().unwrap()["years"], 2);
    }

    #[test]
    fn test_parse_responses_completion() {
        let body = json!({
            "id": "resp_42",
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [{"type": "output_text", "text": "4"}]}
            ]
        });
        let completion = parse_completion(&body).unwrap();
        assert_eq!(completion.text, "4");
        assert_eq!(completion.response_id.as_deref(), Some("resp_42"));
    }

    #[test]
    fn test_parse_unknown_shape_is_malformed() {
        let err = parse_completion(&json!({"error": "nope"})).unwrap_err();
        match err {
            ChatError::MalformedRemoteResponse { body, .. } => assert!(body.contains("nope")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
