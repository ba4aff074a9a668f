//! Anthropic Messages API provider over reqwest.
//!
//! `stream_turn` uses server-sent events and forwards `text_delta`s as they
//! arrive; tool inputs are assembled from their `input_json_delta` fragments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::provider::{
    ContentBlock, LlmProvider, StopReason, ToolCall, TurnRequest, TurnResponse,
};
use crate::backend::TokenUsage;
use crate::error::LlmError;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum error body kept in messages.
const BODY_PREVIEW_LIMIT: usize = 512;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// One `data:` payload of the streaming Messages API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: StreamBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: StreamDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// A tool call whose input JSON is still arriving.
struct PendingTool {
    index: usize,
    id: String,
    name: String,
    input_json: String,
}

/// Accumulates a streamed turn into a [`TurnResponse`].
#[derive(Default)]
struct StreamAccumulator {
    text: String,
    tools: Vec<PendingTool>,
    stop_reason: Option<String>,
    usage: TokenUsage,
    stopped: bool,
}

impl StreamAccumulator {
    /// Fold one event in. Returns the text delta to forward, if any.
    fn apply(&mut self, event: StreamEvent) -> Result<Option<String>, LlmError> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.output_tokens = message.usage.output_tokens;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamBlock::Text { text } if !text.is_empty() => {
                    self.text.push_str(&text);
                    return Ok(Some(text));
                }
                StreamBlock::ToolUse { id, name } => self.tools.push(PendingTool {
                    index,
                    id,
                    name,
                    input_json: String::new(),
                }),
                _ => {}
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                StreamDelta::TextDelta { text } => {
                    self.text.push_str(&text);
                    return Ok(Some(text));
                }
                StreamDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.tools.iter_mut().find(|t| t.index == index) {
                        tool.input_json.push_str(&partial_json);
                    }
                }
                StreamDelta::Other => {}
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = usage {
                    // Output tokens in message_delta are cumulative.
                    self.usage.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                }
            }
            StreamEvent::MessageStop => self.stopped = true,
            StreamEvent::Error { error } => return Err(stream_error(error)),
            StreamEvent::ContentBlockStop | StreamEvent::Ignored => {}
        }
        Ok(None)
    }

    fn finish(self) -> Result<TurnResponse, LlmError> {
        if !self.stopped {
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: "stream ended before message_stop".to_string(),
            });
        }
        let tool_calls = self
            .tools
            .into_iter()
            .map(|tool| {
                let arguments = if tool.input_json.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&tool.input_json).map_err(|e| {
                        LlmError::InvalidResponse {
                            provider: PROVIDER.to_string(),
                            reason: format!("tool {} input: {e}", tool.name),
                        }
                    })?
                };
                Ok(ToolCall {
                    id: tool.id,
                    name: tool.name,
                    arguments,
                })
            })
            .collect::<Result<Vec<_>, LlmError>>()?;
        Ok(TurnResponse {
            text: self.text,
            tool_calls,
            stop_reason: self
                .stop_reason
                .as_deref()
                .map(StopReason::from_wire)
                .unwrap_or(StopReason::Other),
            usage: self.usage,
        })
    }
}

fn stream_error(error: StreamErrorBody) -> LlmError {
    match error.kind.as_str() {
        "rate_limit_error" => LlmError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after: None,
        },
        "authentication_error" | "permission_error" => LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
        },
        "invalid_request_error" => LlmError::BadRequest {
            provider: PROVIDER.to_string(),
            reason: error.message,
        },
        _ => LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("{}: {}", error.kind, error.message),
        },
    }
}

/// Split complete SSE frames off the front of `buf` and return their data payloads.
fn drain_sse_frames(buf: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(end) = buf.windows(2).position(|w| w == b"\n\n") {
        let frame: Vec<u8> = buf.drain(..end + 2).collect();
        let frame = String::from_utf8_lossy(&frame);
        let data: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if !data.is_empty() {
            payloads.push(data.join("\n"));
        }
    }
    payloads
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: SecretString,
        model: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request_body(&self, request: &TurnRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens,
            "messages": request.messages,
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::Value::String(system.clone());
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }
        body
    }

    /// POST to the Messages endpoint, mapping non-2xx answers to errors.
    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        Err(Self::status_error(status, retry_after, &text))
    }

    fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
        let reason = format!("HTTP {}: {}", status.as_u16(), preview_body(body));
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            },
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            },
            s if s.is_client_error() && body.contains("prompt is too long") => {
                LlmError::ContextLengthExceeded {
                    used: 0,
                    limit: 0,
                }
            }
            s if s.is_client_error() && s != StatusCode::REQUEST_TIMEOUT => {
                LlmError::BadRequest {
                    provider: PROVIDER.to_string(),
                    reason,
                }
            }
            _ => LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason,
            },
        }
    }
}

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    if trimmed.len() <= BODY_PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let mut cut = BODY_PREVIEW_LIMIT;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

fn parse_response(response: MessagesResponse) -> TurnResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input,
            }),
            ContentBlock::ToolResult { .. } => {}
        }
    }
    TurnResponse {
        text,
        tool_calls,
        stop_reason: response
            .stop_reason
            .as_deref()
            .map(StopReason::from_wire)
            .unwrap_or(StopReason::Other),
        usage: TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_turn(&self, request: TurnRequest) -> Result<TurnResponse, LlmError> {
        let body = self.request_body(&request);
        let response = self.send(&body).await?;

        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?;
        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("{e}: {}", preview_body(&text)),
            })?;

        let turn = parse_response(parsed);
        tracing::debug!(
            model = %request.model.as_deref().unwrap_or(&self.model),
            input_tokens = turn.usage.input_tokens,
            output_tokens = turn.usage.output_tokens,
            tool_calls = turn.tool_calls.len(),
            "LLM turn completed"
        );
        Ok(turn)
    }

    async fn stream_turn(
        &self,
        request: TurnRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<TurnResponse, LlmError> {
        let mut body = self.request_body(&request);
        body["stream"] = serde_json::Value::Bool(true);
        let response = self.send(&body).await?;

        let mut chunks = response.bytes_stream();
        let mut buf = Vec::new();
        let mut turn = StreamAccumulator::default();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("stream interrupted: {e}"),
            })?;
            buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

            for data in drain_sse_frames(&mut buf) {
                let event: StreamEvent =
                    serde_json::from_str(&data).map_err(|e| LlmError::InvalidResponse {
                        provider: PROVIDER.to_string(),
                        reason: format!("{e}: {}", preview_body(&data)),
                    })?;
                if let Some(text) = turn.apply(event)? {
                    // A closed receiver only means nobody wants the deltas.
                    let _ = deltas.send(text).await;
                }
            }
        }

        let turn = turn.finish()?;
        tracing::debug!(
            model = %request.model.as_deref().unwrap_or(&self.model),
            input_tokens = turn.usage.input_tokens,
            output_tokens = turn.usage.output_tokens,
            tool_calls = turn.tool_calls.len(),
            "LLM streamed turn completed"
        );
        Ok(turn)
    }

    async fn health_check(&self) -> Result<Duration, LlmError> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(started.elapsed())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::status_error(status, None, &text))
        }
    }
}
