//! Server-sent event decoding
//!
//! [`StreamDecoder`] is a line-driven state machine. It never fails on a bad
//! frame: anything it cannot interpret is logged, counted in
//! [`skipped_frames`](StreamDecoder::skipped_frames) and dropped, so one corrupt
//! chunk does not cost the rest of the answer.
//!
//! Both wire shapes are understood:
//!
//! - legacy `choices[0].delta` frames (content and indexed tool-call deltas)
//! - Responses events (`response.output_text.delta`, function-call items and
//!   argument deltas, lifecycle events carrying the response id)

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::core::{ChatError, ChatResult};

use super::types::{Completion, FragmentSink, StreamFragment, ToolCallRequest};

const DATA_PREFIX: &str = "data:";
const END_SENTINEL: &str = "[DONE]";

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Between frames
    AwaitingFrame,
    /// Inside a frame, at least one data line seen
    HaveDataLine,
    /// End sentinel or end of stream observed; no further input is consumed
    Terminal,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Tool-call deltas keyed by their output index
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u64, PartialToolCall>,
}

impl ToolCallAccumulator {
    /// Merge a delta; returns the tool name the first time it becomes known
    fn merge(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Option<String> {
        let call = self.calls.entry(index).or_default();
        if call.id.is_none() {
            call.id = id.filter(|s| !s.is_empty()).map(String::from);
        }
        if let Some(arguments) = arguments {
            call.arguments.push_str(arguments);
        }
        match (call.name.is_none(), name.filter(|s| !s.is_empty())) {
            (true, Some(name)) => {
                call.name = Some(name.to_string());
                Some(name.to_string())
            }
            _ => None,
        }
    }

    fn replace_arguments(&mut self, index: u64, arguments: &str) {
        self.calls.entry(index).or_default().arguments = arguments.to_string();
    }

    fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .filter_map(|(index, call)| {
                Some(ToolCallRequest {
                    name: call.name?,
                    id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                    arguments: call.arguments,
                })
            })
            .collect()
    }
}

/// Incremental SSE decoder
#[derive(Debug)]
pub struct StreamDecoder {
    state: DecoderState,
    text: String,
    tool_calls: ToolCallAccumulator,
    response_id: Option<String>,
    remote_error: Option<String>,
    skipped_frames: usize,
    terminal_emitted: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingFrame,
            text: String::new(),
            tool_calls: ToolCallAccumulator::default(),
            response_id: None,
            remote_error: None,
            skipped_frames: 0,
            terminal_emitted: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state == DecoderState::Terminal
    }

    /// Number of frames dropped because they could not be interpreted
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Error event reported by the remote service inside the stream, if any
    pub fn remote_error(&self) -> Option<&str> {
        self.remote_error.as_deref()
    }

    /// Feed one line and return the fragments it produces, in order
    pub fn feed_line(&mut self, line: &str) -> Vec<StreamFragment> {
        if self.is_terminal() {
            return Vec::new();
        }

        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            self.state = DecoderState::AwaitingFrame;
            return Vec::new();
        }

        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            // `event:`, `id:`, `retry:` and comment lines carry nothing we need
            return Vec::new();
        };
        let payload = payload.trim();
        self.state = DecoderState::HaveDataLine;

        if payload.is_empty() {
            return Vec::new();
        }
        if payload == END_SENTINEL {
            return self.finish_stream();
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(frame) => self.apply_frame(&frame, payload),
            Err(e) => {
                self.skip(payload, &format!("invalid JSON: {}", e));
                Vec::new()
            }
        }
    }

    /// Feed one raw line as read off the wire
    ///
    /// A line that is not valid UTF-8 is dropped like any other uninterpretable frame.
    pub fn feed_bytes(&mut self, line: &[u8]) -> Vec<StreamFragment> {
        match std::str::from_utf8(line) {
            Ok(line) => self.feed_line(line),
            Err(e) => {
                if self.is_terminal() || !line.starts_with(DATA_PREFIX.as_bytes()) {
                    return Vec::new();
                }
                self.state = DecoderState::HaveDataLine;
                self.skip(&String::from_utf8_lossy(line), &format!("invalid UTF-8: {}", e));
                Vec::new()
            }
        }
    }

    /// The transport reported end of stream; a missing sentinel is not an error
    pub fn end_of_stream(&mut self) -> Vec<StreamFragment> {
        if self.terminal_emitted {
            return Vec::new();
        }
        if !self.is_terminal() {
            tracing::debug!("[Stream] Stream ended without sentinel");
        }
        self.finish_stream()
    }

    /// Consume the decoder and return the accumulated result
    pub fn finish(self) -> Completion {
        Completion {
            text: self.text,
            tool_calls: self.tool_calls.finish(),
            response_id: self.response_id,
        }
    }

    fn finish_stream(&mut self) -> Vec<StreamFragment> {
        self.state = DecoderState::Terminal;
        if self.terminal_emitted {
            return Vec::new();
        }
        self.terminal_emitted = true;
        vec![StreamFragment::terminal()]
    }

    fn skip(&mut self, payload: &str, reason: &str) {
        self.skipped_frames += 1;
        let preview: String = payload.chars().take(120).collect();
        tracing::warn!("[Stream] Skipping frame ({}): {}", reason, preview);
    }

    fn push_text(&mut self, delta: &str, out: &mut Vec<StreamFragment>) {
        if delta.is_empty() {
            return;
        }
        self.text.push_str(delta);
        out.push(StreamFragment::content(delta));
    }

    fn apply_frame(&mut self, frame: &Value, payload: &str) -> Vec<StreamFragment> {
        let mut out = Vec::new();

        if let Some(choices) = frame.get("choices").and_then(Value::as_array) {
            self.apply_chat_delta(choices, &mut out);
            return out;
        }

        let Some(event_type) = frame.get("type").and_then(Value::as_str) else {
            self.skip(payload, "unrecognized frame shape");
            return out;
        };

        match event_type {
            "response.output_text.delta" => match frame.get("delta").and_then(Value::as_str) {
                Some(delta) => self.push_text(delta, &mut out),
                None => self.skip(payload, "text delta without 'delta'"),
            },
            "response.output_item.added" | "response.output_item.done" => {
                let item = frame.get("item");
                if item.and_then(|i| i.get("type")).and_then(Value::as_str) == Some("function_call") {
                    let index = output_index(frame);
                    let item = item.unwrap_or(&Value::Null);
                    let id = item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str);
                    let name = item.get("name").and_then(Value::as_str);
                    if let Some(name) = self.tool_calls.merge(index, id, name, None) {
                        out.push(StreamFragment::tool_call(name));
                    }
                    if event_type == "response.output_item.done" {
                        if let Some(arguments) = item.get("arguments").and_then(Value::as_str) {
                            self.tool_calls.replace_arguments(index, arguments);
                        }
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                match frame.get("delta").and_then(Value::as_str) {
                    Some(delta) => {
                        self.tool_calls
                            .merge(output_index(frame), None, None, Some(delta));
                    }
                    None => self.skip(payload, "argument delta without 'delta'"),
                }
            }
            "response.function_call_arguments.done" => {
                if let Some(arguments) = frame.get("arguments").and_then(Value::as_str) {
                    self.tool_calls.replace_arguments(output_index(frame), arguments);
                }
            }
            "response.created" | "response.in_progress" | "response.completed" => {
                if let Some(id) = frame
                    .get("response")
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_str)
                {
                    self.response_id = Some(id.to_string());
                }
            }
            "response.failed" | "error" => {
                let message = frame
                    .pointer("/response/error/message")
                    .or_else(|| frame.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("remote error")
                    .to_string();
                tracing::warn!("[Stream] Remote reported error: {}", message);
                self.remote_error = Some(message);
            }
            other if other.starts_with("response.") => {
                tracing::trace!("[Stream] Ignoring event {}", other);
            }
            _ => self.skip(payload, "unrecognized event type"),
        }
        out
    }

    fn apply_chat_delta(&mut self, choices: &[Value], out: &mut Vec<StreamFragment>) {
        let Some(delta) = choices.first().and_then(|c| c.get("delta")) else {
            return;
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            self.push_text(content, out);
        }

        let calls = delta.get("tool_calls").and_then(Value::as_array);
        for (position, call) in calls.into_iter().flatten().enumerate() {
            let index = call
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(position as u64);
            let function = call.get("function");
            let name = function.and_then(|f| f.get("name")).and_then(Value::as_str);
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str);
            let id = call.get("id").and_then(Value::as_str);
            if let Some(name) = self.tool_calls.merge(index, id, name, arguments) {
                out.push(StreamFragment::tool_call(name));
            }
        }
    }
}

fn output_index(frame: &Value) -> u64 {
    frame
        .get("output_index")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Drive a decoder from a buffered reader until a terminal condition
///
/// Every fragment goes to `sink` in arrival order; `delivered` counts content and
/// tool-call fragments handed out so the caller can tell whether a retry is safe.
pub async fn decode_stream<R>(
    reader: R,
    decoder: &mut StreamDecoder,
    sink: FragmentSink<'_>,
    delivered: &mut usize,
    cancel: &CancellationToken,
) -> ChatResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.split(b'\n');

    while !decoder.is_terminal() {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            line = lines.next_segment() => line?,
        };

        let fragments = match next {
            Some(line) => decoder.feed_bytes(&line),
            None => decoder.end_of_stream(),
        };
        for fragment in fragments {
            if !fragment.is_terminal {
                *delivered += 1;
            }
            sink(fragment);
        }
    }

    if decoder.skipped_frames() > 0 {
        tracing::info!(
            "[Stream] Completed with {} skipped frame(s)",
            decoder.skipped_frames()
        );
    }
    Ok(())
}
