use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use muni_assist_sdk::conversation::InMemoryConversationStore;
use muni_assist_sdk::llm::{RetryPolicy, StaticEnvironment, StreamFragment, Transport};
use muni_assist_sdk::orchestrator::ChatPathState;
use muni_assist_sdk::tools::{FnTool, ToolRegistry, ToolResult};
use muni_assist_sdk::{ChatConfig, ChatError, ChatOrchestrator, HealthStatus, WireShape};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "xai-test-key-0123456789abcdef";

fn config(server: &MockServer) -> ChatConfig {
    ChatConfig::new()
        .with_endpoint(server.uri())
        .with_wire_shape(WireShape::LegacyChat)
        .with_model("grok-3")
        .with_api_key(KEY)
}

fn transport() -> Transport {
    Transport::new(Duration::from_secs(5))
        .unwrap()
        .with_retry_policy(RetryPolicy {
            base_backoff: Duration::from_millis(5),
            abort_retry_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        })
}

fn sse(chunks: &[&str]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        let frame = json!({"choices": [{"delta": {"content": chunk}}]});
        body.push_str(&format!("data: {}\n\n", frame));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn streaming_response(chunks: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse(chunks))
}

#[tokio::test]
async fn test_simple_question_through_sdk_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(streaming_response(&["2 + 2", " = 4"]))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = ChatOrchestrator::builder(config(&server))
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .with_store(store.clone())
        .build()
        .unwrap();

    let mut fragments = Vec::new();
    let mut sink = |f: StreamFragment| fragments.push(f);
    let outcome = orchestrator
        .ask(
            "What is 2+2?",
            Some("budget-1"),
            Some("You help with budgets."),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.text, "2 + 2 = 4");
    assert_eq!(outcome.attempted, vec![ChatPathState::SdkStreaming]);
    assert_eq!(fragments.iter().filter(|f| f.is_terminal).count(), 1);

    let history = orchestrator.history().load("budget-1", None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(store.len().await, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unregistered_sdk_falls_through_to_http_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(streaming_response(&["Fund balance is healthy."]))
        .mount(&server)
        .await;

    let orchestrator = ChatOrchestrator::builder(config(&server))
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .without_chat_service()
        .build()
        .unwrap();

    let mut sink = |_: StreamFragment| {};
    let outcome = orchestrator
        .ask("How is the water fund?", None, None, &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.text, "Fund balance is healthy.");
    assert_eq!(
        outcome.attempted,
        vec![ChatPathState::SdkStreaming, ChatPathState::HttpStreamingFallback]
    );
    assert_eq!(outcome.state, Some(ChatPathState::HttpStreamingFallback));
}

#[tokio::test]
async fn test_no_credential_makes_no_requests() {
    let server = MockServer::start().await;
    let config = ChatConfig::new().with_endpoint(server.uri());

    let orchestrator = ChatOrchestrator::builder(config)
        .with_environment(Arc::new(StaticEnvironment::new()))
        .build()
        .unwrap();

    let mut sink = |_: StreamFragment| {};
    let outcome = orchestrator
        .ask("hello", None, None, &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.text, "No API key configured");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_http_non_streaming_returns_unrecognized_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answer": "42"})))
        .mount(&server)
        .await;

    let orchestrator = ChatOrchestrator::builder(config(&server).with_sdk_enabled(false))
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .build()
        .unwrap();

    let mut sink = |_: StreamFragment| {};
    let outcome = orchestrator
        .ask("Anything", None, None, &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.attempted,
        vec![
            ChatPathState::HttpStreamingFallback,
            ChatPathState::HttpNonStreamingFallback
        ]
    );
    assert!(outcome.text.contains("\"answer\""));
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_rejected_key_surfaces_without_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
        .mount(&server)
        .await;

    let orchestrator = ChatOrchestrator::builder(config(&server))
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .build()
        .unwrap();

    let mut sink = |_: StreamFragment| {};
    let outcome = orchestrator
        .ask("hello", None, None, &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome.error, Some(ChatError::CredentialInvalid(_))));
    assert_eq!(outcome.attempted.len(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_tool_heavy_prompt_runs_tool_loop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("\"role\":\"tool\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Revenue grows 3% next year."}}]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "forecast_revenue", "arguments": "{\"years\": 1}"}
                }]
            }}]
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let config = config(&server).with_tool_keywords(["forecast"]);
    let mut tools = ToolRegistry::from_config(&config);
    tools.register(
        "budget",
        FnTool::new(
            "forecast_revenue",
            "Forecast utility revenue",
            json!({"type": "object", "properties": {"years": {"type": "integer"}}}),
            move |_args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolResult::success("{\"growth\": 0.03}"))
                }
            },
        ),
    );

    let orchestrator = ChatOrchestrator::builder(config)
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .with_tools(tools)
        .build()
        .unwrap();

    let mut sink = |_: StreamFragment| {};
    let outcome = orchestrator
        .ask("Forecast revenue for next year", None, None, &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, Some(ChatPathState::SdkNonStreamingForTools));
    assert_eq!(outcome.text, "Revenue grows 3% next year.");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_health_check_reports_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "grok-4"}]})))
        .mount(&server)
        .await;

    let orchestrator = ChatOrchestrator::builder(config(&server))
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .build()
        .unwrap();

    let report = orchestrator.health_check(&CancellationToken::new()).await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.model, "grok-3");
    assert_eq!(report.credential_source, "config-file");
    assert!(!report.masked_credential.contains("0123456789"));
}

#[tokio::test]
async fn test_initialize_model_switches_to_discovered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "grok-4"}]})))
        .mount(&server)
        .await;

    let orchestrator = ChatOrchestrator::builder(config(&server).with_auto_select_model(true))
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(transport())
        .build()
        .unwrap();

    let model = orchestrator.initialize_model(&CancellationToken::new()).await;
    assert_eq!(model, "grok-4");
    assert_eq!(orchestrator.model().current().await, "grok-4");
}

#[tokio::test]
async fn test_health_check_bounded_when_models_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.discovery_timeout_secs = 1;
    // Default policy backs off 1 s, 2 s and 4 s between attempts
    let orchestrator = ChatOrchestrator::builder(config)
        .with_environment(Arc::new(StaticEnvironment::new()))
        .with_transport(Transport::new(Duration::from_secs(5)).unwrap())
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let report = orchestrator.health_check(&CancellationToken::new()).await;

    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(started.elapsed() < Duration::from_secs(3));
}
