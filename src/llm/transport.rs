//! HTTP transport with retry and backoff
//!
//! All network traffic goes through [`Transport`]. It owns the process-wide
//! `reqwest::Client` and applies one retry policy:
//!
//! - HTTP 429: exponential backoff (1 s, 2 s, 4 s by default), at most three retries
//! - connection reset/abort: one retry after 500 ms, then `TransientNetworkFailure`
//! - 401/403/other non-2xx: classified immediately, no retry
//!
//! Deadlines surface as [`ChatError::Timeout`]; a fired `CancellationToken` surfaces as
//! [`ChatError::Cancelled`], including while a backoff sleep is pending.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::core::{ChatConfig, ChatError, ChatResult};

use super::credentials::redact_secrets;
use super::stream::{decode_stream, StreamDecoder};
use super::types::{Completion, FragmentSink};

/// Retry limits and delays
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after HTTP 429 before surfacing `RateLimited`
    pub max_rate_limit_retries: u32,
    /// First 429 backoff; doubles on each further retry
    pub base_backoff: Duration,
    /// Delay before retrying an aborted connection
    pub abort_retry_delay: Duration,
    /// Retries after a connection abort
    pub max_abort_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 3,
            base_backoff: Duration::from_secs(1),
            abort_retry_delay: Duration::from_millis(500),
            max_abort_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given 429 retry (0-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Shared HTTP transport
#[derive(Clone)]
pub struct Transport {
    client: Client,
    retry: RetryPolicy,
    request_timeout: Duration,
    max_error_body: usize,
}

impl Transport {
    /// Create a transport with the given per-request ceiling
    pub fn new(request_timeout: Duration) -> ChatResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChatError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            retry: RetryPolicy::default(),
            request_timeout,
            max_error_body: 2000,
        })
    }

    pub fn from_config(config: &ChatConfig) -> ChatResult<Self> {
        Ok(Self::new(config.request_timeout())?.with_max_error_body(config.max_error_body_chars))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_error_body(mut self, chars: usize) -> Self {
        self.max_error_body = chars;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// POST a JSON body and parse the JSON answer
    ///
    /// A 2xx body that is not JSON is reported as `MalformedRemoteResponse` carrying
    /// the (bounded) raw text.
    pub async fn post_json(
        &self,
        url: &Url,
        api_key: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> ChatResult<Value> {
        tracing::debug!("[Transport] POST {}", url);
        let response = self
            .send_with_retry(
                || self.client.post(url.clone()).bearer_auth(api_key).json(body),
                self.request_timeout,
                &mut 0,
                cancel,
            )
            .await?;

        let text = self.read_text(response, self.request_timeout, cancel).await?;
        serde_json::from_str(&text).map_err(|e| {
            ChatError::malformed(format!("response is not JSON: {}", e), self.bound(&text))
        })
    }

    /// POST a streaming request and decode the event stream into `sink`
    ///
    /// A connection abort before any fragment was delivered is retried once; after
    /// the first fragment a failure is surfaced so delivered text is never repeated.
    /// Aborts while connecting and while reading share the same retry allowance.
    pub async fn post_stream(
        &self,
        url: &Url,
        api_key: &str,
        body: &Value,
        sink: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> ChatResult<Completion> {
        let mut abort_retries = 0u32;

        loop {
            tracing::debug!("[Transport] POST (stream) {}", url);
            let response = self
                .send_with_retry(
                    || {
                        self.client
                            .post(url.clone())
                            .bearer_auth(api_key)
                            .header(reqwest::header::ACCEPT, "text/event-stream")
                            .json(body)
                    },
                    self.request_timeout,
                    &mut abort_retries,
                    cancel,
                )
                .await?;

            tracing::info!("[Transport] Streaming response started");
            let byte_stream = response
                .bytes_stream()
                .map(|result| result.map_err(io::Error::other));
            let reader = BufReader::new(StreamReader::new(byte_stream));

            let mut decoder = StreamDecoder::new();
            let mut delivered = 0usize;
            let outcome = tokio::time::timeout(
                self.request_timeout,
                decode_stream(reader, &mut decoder, &mut *sink, &mut delivered, cancel),
            )
            .await;

            match outcome {
                Err(_) => return Err(ChatError::Timeout(self.request_timeout)),
                Ok(Ok(())) => return finish_decoder(decoder),
                Ok(Err(ChatError::Io(e))) => {
                    let retryable = delivered == 0
                        && abort_retries < self.retry.max_abort_retries
                        && is_connection_abort(&e);
                    if !retryable {
                        tracing::error!(
                            "[Transport] Stream failed after {} fragment(s): {}",
                            delivered,
                            e
                        );
                        return Err(ChatError::TransientNetworkFailure(e.to_string()));
                    }
                    tracing::warn!(
                        "[Transport] Stream aborted before first fragment, retrying in {:?}: {}",
                        self.retry.abort_retry_delay,
                        e
                    );
                    pause(self.retry.abort_retry_delay, cancel).await?;
                    abort_retries += 1;
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// GET a JSON document under its own deadline
    pub async fn get_json(
        &self,
        url: &Url,
        api_key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ChatResult<Value> {
        tracing::debug!("[Transport] GET {}", url);
        let response = self
            .send_with_retry(
                || self.client.get(url.clone()).bearer_auth(api_key),
                timeout,
                &mut 0,
                cancel,
            )
            .await?;
        let text = self.read_text(response, timeout, cancel).await?;
        serde_json::from_str(&text).map_err(|e| {
            ChatError::malformed(format!("response is not JSON: {}", e), self.bound(&text))
        })
    }

    /// Send one request without retry and return the raw status and body
    pub async fn probe(
        &self,
        url: &Url,
        api_key: &str,
        body: &Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ChatResult<(u16, String)> {
        let request = self.client.post(url.clone()).bearer_auth(api_key).json(body);
        let response = self.send_once(request, timeout, cancel).await?;
        let status = response.status().as_u16();
        let text = self.read_text(response, timeout, cancel).await?;
        Ok((status, self.bound(&text)))
    }

    async fn send_with_retry<F>(
        &self,
        build: F,
        timeout: Duration,
        abort_retries: &mut u32,
        cancel: &CancellationToken,
    ) -> ChatResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut rate_limit_retries = 0u32;

        loop {
            match self.send_once(build(), timeout, cancel).await {
                Ok(response) if response.status().is_success() => {
                    if rate_limit_retries > 0 || *abort_retries > 0 {
                        tracing::info!(
                            "[Transport] Request succeeded after {} rate-limit and {} abort retries",
                            rate_limit_retries,
                            abort_retries
                        );
                    }
                    return Ok(response);
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let body = self.read_text(response, timeout, cancel).await.unwrap_or_default();
                    if rate_limit_retries >= self.retry.max_rate_limit_retries {
                        tracing::error!(
                            "[Transport] Rate limited after {} retries",
                            rate_limit_retries
                        );
                        return Err(ChatError::RateLimited {
                            retries: rate_limit_retries,
                            body: self.bound(&body),
                        });
                    }
                    let delay = self.retry.backoff_for(rate_limit_retries);
                    tracing::warn!(
                        "[Transport] HTTP 429, retry {} of {} in {:?}",
                        rate_limit_retries + 1,
                        self.retry.max_rate_limit_retries,
                        delay
                    );
                    pause(delay, cancel).await?;
                    rate_limit_retries += 1;
                }
                Ok(response) => return Err(self.status_error(response, timeout, cancel).await),
                Err(ChatError::TransientNetworkFailure(message))
                    if *abort_retries < self.retry.max_abort_retries =>
                {
                    tracing::warn!(
                        "[Transport] Connection failed, retrying in {:?}: {}",
                        self.retry.abort_retry_delay,
                        message
                    );
                    pause(self.retry.abort_retry_delay, cancel).await?;
                    *abort_retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        request: RequestBuilder,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ChatResult<Response> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            result = tokio::time::timeout(timeout, request.send()) => match result {
                Err(_) => Err(ChatError::Timeout(timeout)),
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) if e.is_timeout() => Err(ChatError::Timeout(timeout)),
                Ok(Err(e)) => {
                    if is_connection_abort(&e) {
                        tracing::debug!("[Transport] Connection aborted: {}", e);
                    }
                    Err(ChatError::TransientNetworkFailure(e.to_string()))
                }
            },
        }
    }

    async fn read_text(
        &self,
        response: Response,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            result = tokio::time::timeout(timeout, response.text()) => match result {
                Err(_) => Err(ChatError::Timeout(timeout)),
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(ChatError::TransientNetworkFailure(e.to_string())),
            },
        }
    }

    async fn status_error(
        &self,
        response: Response,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ChatError {
        let status = response.status().as_u16();
        let body = match self.read_text(response, timeout, cancel).await {
            Ok(text) => self.bound(&text),
            Err(ChatError::Cancelled) => return ChatError::Cancelled,
            Err(_) => "Failed to read error body".to_string(),
        };
        tracing::error!("[Transport] API error: {} - {}", status, body);
        classify_status(status, body)
    }

    /// Redact and truncate a body for diagnostics
    pub fn bound(&self, text: &str) -> String {
        let redacted = redact_secrets(text);
        if redacted.chars().count() <= self.max_error_body {
            return redacted;
        }
        let mut bounded: String = redacted.chars().take(self.max_error_body).collect();
        bounded.push_str("...");
        bounded
    }
}

fn finish_decoder(decoder: StreamDecoder) -> ChatResult<Completion> {
    if let Some(error) = decoder.remote_error().map(String::from) {
        let completion = decoder.finish();
        if completion.text.is_empty() && !completion.has_tool_calls() {
            return Err(ChatError::malformed(error.clone(), error));
        }
        return Ok(completion);
    }
    Ok(decoder.finish())
}

/// Map a non-2xx, non-429 status to an error
pub fn classify_status(status: u16, body: String) -> ChatError {
    match status {
        401 => ChatError::CredentialInvalid(body),
        403 => ChatError::CredentialInsufficientScope(body),
        _ => ChatError::Http { status, body },
    }
}

/// Sleep unless cancelled first
async fn pause(delay: Duration, cancel: &CancellationToken) -> ChatResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn is_abort_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Whether an error chain contains a reset/aborted connection
pub fn is_connection_abort(err: &(dyn StdError + 'static)) -> bool {
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        if is_abort_kind(io_err.kind()) {
            return true;
        }
        if let Some(inner) = io_err.get_ref() {
            if is_connection_abort(inner) {
                return true;
            }
        }
    }
    if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
        if reqwest_err.is_connect() {
            return true;
        }
    }
    err.source().is_some_and(is_connection_abort)
}
