use std::sync::Arc;
use std::time::Duration;

use muni_assist_sdk::llm::{
    CredentialHandle, CredentialResolver, ModelSelector, StaticEnvironment, Transport,
};
use muni_assist_sdk::ChatError;
use reqwest::Url;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential(key: Option<&str>) -> CredentialHandle {
    CredentialHandle::resolve(
        CredentialResolver::new("XAI")
            .with_environment(Arc::new(StaticEnvironment::new()))
            .with_config_key(key.map(String::from)),
    )
}

fn selector(server: &MockServer, key: Option<&str>) -> ModelSelector {
    let url = Url::parse(&format!("{}/models", server.uri())).unwrap();
    ModelSelector::new(
        Transport::new(Duration::from_secs(5)).unwrap(),
        credential(key),
        url,
    )
    .with_timeout(Duration::from_millis(500))
}

const KEY: &str = "xai-test-key-0123456789abcdef";

#[tokio::test]
async fn test_selects_preferred_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "grok-3", "owned_by": "xai"},
                {"id": "grok-4", "owned_by": "xai"},
                {"id": "grok-2-vision"}
            ]
        })))
        .mount(&server)
        .await;

    let choice = selector(&server, Some(KEY))
        .select_best_model("grok-3-mini", &CancellationToken::new())
        .await;
    assert_eq!(choice.as_deref(), Some("grok-4"));
}

#[tokio::test]
async fn test_falls_back_to_known_family() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"id": "other-model"}, {"id": "grok-3-beta"}]
        })))
        .mount(&server)
        .await;

    let choice = selector(&server, Some(KEY))
        .select_best_model("grok-4", &CancellationToken::new())
        .await;
    assert_eq!(choice.as_deref(), Some("grok-3-beta"));
}

#[tokio::test]
async fn test_discovery_failure_keeps_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let choice = selector(&server, Some(KEY))
        .select_best_model("grok-4", &CancellationToken::new())
        .await;
    assert_eq!(choice, None);
}

#[tokio::test]
async fn test_discovery_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"id": "grok-4"}]}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let choice = selector(&server, Some(KEY))
        .select_best_model("grok-3", &CancellationToken::new())
        .await;
    assert_eq!(choice, None);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_list_models_without_key() {
    let server = MockServer::start().await;

    let result = selector(&server, None)
        .list_models(&CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ChatError::CredentialMissing)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
