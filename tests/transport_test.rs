use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use muni_assist_sdk::llm::{RetryPolicy, StreamFragment, Transport};
use muni_assist_sdk::ChatError;
use reqwest::Url;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "xai-test-key-0123456789abcdef";

fn fast_transport(base_backoff: Duration) -> Transport {
    Transport::new(Duration::from_secs(5))
        .unwrap()
        .with_retry_policy(RetryPolicy {
            base_backoff,
            abort_retry_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        })
}

/// Raw server that hands each accepted connection to `respond`, counting connections
async fn raw_server<F>(respond: F) -> (Url, Arc<AtomicUsize>)
where
    F: Fn(usize) -> Option<&'static [u8]> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            if let Some(reply) = respond(n) {
                let _ = socket.write_all(reply).await;
                let _ = socket.flush().await;
            }
            // Dropping the socket closes the connection mid-exchange
        }
    });

    let url = Url::parse(&format!("http://{}/chat/completions", addr)).unwrap();
    (url, connections)
}

fn chat_url(server: &MockServer) -> Url {
    Url::parse(&format!("{}/chat/completions", server.uri())).unwrap()
}

#[tokio::test]
async fn test_rate_limit_backoff_then_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .with_priority(2)
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_millis(20));
    let started = Instant::now();
    let value = transport
        .post_json(&chat_url(&server), KEY, &json!({}), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(value, json!({"ok": true}));
    // 20 + 40 + 80 ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_rate_limit_exhausted() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_millis(5));
    let result = transport
        .post_json(&chat_url(&server), KEY, &json!({}), &CancellationToken::new())
        .await;

    match result {
        Err(ChatError::RateLimited { retries, body }) => {
            assert_eq!(retries, 3);
            assert!(body.contains("quota"));
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("authorization", format!("Bearer {}", KEY).as_str()))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_millis(5));
    let result = transport
        .post_json(&chat_url(&server), KEY, &json!({}), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ChatError::CredentialInvalid(_))));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_error_body_surfaced() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database on fire"))
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_millis(5));
    let result = transport
        .post_json(&chat_url(&server), KEY, &json!({}), &CancellationToken::new())
        .await;

    match result {
        Err(ChatError::Http { status, body }) => {
            assert_eq!(status, 500);
            assert!(body.contains("database on fire"));
        }
        other => panic!("expected Http error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_skips_malformed_frame() {
    let server = MockServer::start().await;

    let sse = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {not json\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_millis(5));
    let mut fragments = Vec::new();
    let mut sink = |f: StreamFragment| fragments.push(f);
    let completion = transport
        .post_stream(
            &chat_url(&server),
            KEY,
            &json!({"stream": true}),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(completion.text, "Hello world");
    let text: String = fragments
        .iter()
        .filter(|f| !f.is_terminal)
        .map(|f| f.text.as_str())
        .collect();
    assert_eq!(text, "Hello world");
    assert_eq!(fragments.iter().filter(|f| f.is_terminal).count(), 1);
}

#[tokio::test]
async fn test_cancel_stops_backoff() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = transport
        .post_json(&chat_url(&server), KEY, &json!({}), &cancel)
        .await;

    assert!(matches!(result, Err(ChatError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stream_skips_invalid_utf8_frame() {
    let server = MockServer::start().await;

    let mut sse = Vec::new();
    sse.extend_from_slice(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n");
    sse.extend_from_slice(b"data: {\"choices\":[{\"delta\":{\"content\":\"\xff\xfe\"}}]}\n\n");
    sse.extend_from_slice(b"data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n");
    sse.extend_from_slice(b"data: [DONE]\n\n");
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_bytes(sse),
        )
        .mount(&server)
        .await;

    let transport = fast_transport(Duration::from_millis(5));
    let mut sink = |_: StreamFragment| {};
    let completion = transport
        .post_stream(
            &chat_url(&server),
            KEY,
            &json!({"stream": true}),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(completion.text, "Hello world");
}

#[tokio::test]
async fn test_dropped_connection_retried_once() {
    let (url, connections) = raw_server(|_| None).await;

    let transport = fast_transport(Duration::from_millis(5));
    let result = transport
        .post_json(&url, KEY, &json!({}), &CancellationToken::new())
        .await;

    assert!(
        matches!(result, Err(ChatError::TransientNetworkFailure(_))),
        "expected TransientNetworkFailure, got {:?}",
        result
    );
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_abort_retry_shared_between_connect_and_stream() {
    const BROKEN_STREAM: &[u8] = b"HTTP/1.1 200 OK\r\n\
content-type: text/event-stream\r\n\
transfer-encoding: chunked\r\n\r\n";
    const FULL_STREAM: &[u8] = b"HTTP/1.1 200 OK\r\n\
content-type: text/event-stream\r\n\
content-length: 14\r\n\r\n\
data: [DONE]\n\n";

    // Connection 0 drops before answering, connection 1 breaks mid-stream
    let (url, connections) = raw_server(|n| match n {
        0 => None,
        1 => Some(BROKEN_STREAM),
        _ => Some(FULL_STREAM),
    })
    .await;

    let transport = fast_transport(Duration::from_millis(5));
    let mut sink = |_: StreamFragment| {};
    let result = transport
        .post_stream(
            &url,
            KEY,
            &json!({"stream": true}),
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

    assert!(
        matches!(result, Err(ChatError::TransientNetworkFailure(_))),
        "expected TransientNetworkFailure, got {:?}",
        result
    );
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_deadline_is_timeout_not_cancelled() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let transport = Transport::new(Duration::from_millis(300)).unwrap();
    let started = Instant::now();
    let result = transport
        .post_json(&chat_url(&server), KEY, &json!({}), &CancellationToken::new())
        .await;

    match result {
        Err(ChatError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(300)),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}
