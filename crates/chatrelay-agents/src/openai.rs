use crate::providers::{
    ChatMessage, LlmProvider, LlmRequest, LlmResponse, LlmStream, LlmStreamResponse, Transcriber,
    Usage,
};
use async_trait::async_trait;
use bytes::Bytes;
use chatrelay_common::{Error, Result};
use futures::Stream;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONTEXT_TOO_LONG_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "reduce the length of the messages",
];

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    transcription_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: Client::new(),
            api_key,
            base_url,
            transcription_model: "whisper-1".to_string(),
        }
    }

    pub fn with_transcription_model(mut self, model: impl Into<String>) -> Self {
        self.transcription_model = model.into();
        self
    }

    async fn post_chat(&self, request: &LlmRequest, stream: bool) -> Result<Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiRequest::from_request(request, stream);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("OpenAI request failed: {e}")))?;

        check_status(response).await
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let response = self.post_chat(request, false).await?;
        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse OpenAI response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Agent("no choices in OpenAI response".into()))?;

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            model: parsed.model,
            usage: parsed.usage.map(Usage::from),
        })
    }

    async fn complete_stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let response = self.post_chat(request, true).await?;
        Ok(Box::pin(SseParser::new(response.bytes_stream())))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self.client.get(&url).bearer_auth(&self.api_key).send().await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                debug!("OpenAI health check failed: {e}");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Transcriber for OpenAiProvider {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let url = format!("{}/audio/transcriptions", self.base_url);
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| Error::Media(format!("failed to read {}: {e}", audio.display())))?;
        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| Error::Agent(format!("invalid transcription payload: {e}")))?;
        let form = Form::new()
            .text("model", self.transcription_model.clone())
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("OpenAI transcription request failed: {e}")))?;
        let response = check_status(response).await?;

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse transcription response: {e}")))?;
        Ok(parsed.text)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status, &body))
}

/// Map a non-success API response to an error, singling out context overflow.
fn api_error(status: StatusCode, body: &str) -> Error {
    if CONTEXT_TOO_LONG_MARKERS.iter().any(|m| body.contains(m)) {
        warn!("OpenAI rejected the dialog as too long (status {status})");
        return Error::ContextTooLong;
    }
    Error::Agent(format!(
        "OpenAI API error: status={}, body={}",
        status.as_u16(),
        body.trim()
    ))
}

// Request types
#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "str::is_empty")]
    user: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

impl<'a> OpenAiRequest<'a> {
    fn from_request(request: &'a LlmRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            user: &request.user,
            stream,
            stream_options: stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

// Response types
#[derive(Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens.saturating_add(u.completion_tokens)),
        }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

/// Turns a server-sent-events byte stream into completion chunks.
struct SseParser {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    queue: VecDeque<Result<LlmStreamResponse>>,
    done: bool,
}

impl SseParser {
    fn new(stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
            buffer: Vec::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }

    /// Split complete events off the buffer and queue what they carry.
    fn drain_events(&mut self) {
        while let Some((pos, len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..pos).collect();
            self.buffer.drain(..len);
            self.parse_event(&String::from_utf8_lossy(&event));
        }
    }

    fn parse_event(&mut self, event: &str) {
        if self.done {
            return;
        }
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            if data.is_empty() {
                continue;
            }

            match serde_json::from_str::<OpenAiStreamChunk>(data) {
                Ok(chunk) if chunk.error.is_some() => {
                    // The server gave up mid-stream; nothing follows.
                    self.queue.push_back(Err(api_error(StatusCode::OK, data)));
                    self.done = true;
                    return;
                }
                Ok(chunk) => self.queue_chunk(chunk),
                Err(e) => {
                    if data.contains("\"error\"") {
                        self.queue.push_back(Err(api_error(StatusCode::OK, data)));
                    } else {
                        self.queue
                            .push_back(Err(Error::Agent(format!("JSON parse error: {e}"))));
                    }
                }
            }
        }
    }

    fn queue_chunk(&mut self, chunk: OpenAiStreamChunk) {
        let model = chunk.model.filter(|m| !m.is_empty());
        let usage = chunk.usage.map(Usage::from);

        if chunk.choices.is_empty() {
            if usage.is_some() || model.is_some() {
                self.queue.push_back(Ok(LlmStreamResponse {
                    delta: String::new(),
                    model,
                    usage,
                    stop_reason: None,
                }));
            }
            return;
        }

        for choice in chunk.choices {
            self.queue.push_back(Ok(LlmStreamResponse {
                delta: choice.delta.content.unwrap_or_default(),
                model: model.clone(),
                usage,
                stop_reason: choice.finish_reason,
            }));
        }
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

impl Stream for SseParser {
    type Item = Result<LlmStreamResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.drain_events();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(Error::Agent(format!("stream error: {e}")))));
                }
                Poll::Ready(None) => {
                    // Flush a trailing event that lacks the final blank line.
                    if !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        self.parse_event(&String::from_utf8_lossy(&rest));
                    }
                    self.done = true;
                    if self.queue.is_empty() {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
