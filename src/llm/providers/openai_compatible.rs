use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::llm::action_parser;
use crate::llm::provider::LlmProvider;
use crate::llm::sse_parser;
use crate::llm::types::{ChatMessage, ModelError, ModelResponse, StreamChunkKind, WireMessage};

/// Streaming client for a `/chat/completions` endpoint.
pub struct OpenAiCompatibleProvider {
    endpoint: String,
    api_key: String,
    cfg: LlmConfig,
    client: reqwest::Client,
    /// Token of the request in flight, cancelled by `abort`.
    active: Mutex<Option<CancellationToken>>,
}

impl OpenAiCompatibleProvider {
    pub fn new(cfg: &LlmConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| ModelError::ConnectionFailed(format!("http client: {e}")))?;
        Ok(Self {
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key: cfg.resolved_api_key(),
            cfg: cfg.clone(),
            client,
            active: Mutex::new(None),
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let wire: Vec<WireMessage> = messages.iter().map(WireMessage::from).collect();
        serde_json::json!({
            "model": self.cfg.model,
            "messages": wire,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
            "top_p": self.cfg.top_p,
            "frequency_penalty": self.cfg.frequency_penalty,
            "stream": true,
        })
    }

    fn track(&self, token: CancellationToken) -> ActiveRequest<'_> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        ActiveRequest { slot: &self.active }
    }

    /// Read SSE lines until `[DONE]` or end of stream. Returns the accumulated
    /// content and the time to the first content token.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        token: &CancellationToken,
        started: Instant,
    ) -> Result<(String, Option<u64>), ModelError> {
        let mut byte_stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut reasoning_len = 0usize;
        let mut first_token_ms = None;

        'stream: loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ModelError::Cancelled),
                next = byte_stream.next() => next,
            };
            let Some(bytes) = next else { break };
            pending.extend_from_slice(&bytes?);

            // Split on complete lines only; a multi-byte character may straddle chunks.
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                if handle_line(line.trim(), &mut content, &mut reasoning_len) {
                    break 'stream;
                }
                if first_token_ms.is_none() && !content.is_empty() {
                    first_token_ms = Some(started.elapsed().as_millis() as u64);
                }
            }
        }

        if !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).into_owned();
            handle_line(line.trim(), &mut content, &mut reasoning_len);
            if first_token_ms.is_none() && !content.is_empty() {
                first_token_ms = Some(started.elapsed().as_millis() as u64);
            }
        }

        tracing::debug!(reasoning_len, "reasoning deltas skipped");
        Ok((content, first_token_ms))
    }
}

/// Apply one SSE line; true once the stream is finished.
fn handle_line(line: &str, content: &mut String, reasoning_len: &mut usize) -> bool {
    if line.is_empty() {
        return false;
    }
    match sse_parser::parse_sse_line(line) {
        Ok(chunks) => {
            let mut done = false;
            for chunk in chunks {
                match chunk.kind {
                    StreamChunkKind::Content => content.push_str(&chunk.content),
                    StreamChunkKind::Reasoning => *reasoning_len += chunk.content.len(),
                    StreamChunkKind::Done => done = true,
                }
            }
            done
        }
        Err(e) => {
            tracing::debug!("SSE line skipped: {e}");
            false
        }
    }
}

/// Request body for logging, with image data URLs replaced.
fn sanitized_for_log(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|u| u.get_mut("url")) {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

/// Clears the active-request slot however the request ends.
struct ActiveRequest<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.cfg.model
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let token = cancel.child_token();
        let _active = self.track(token.clone());
        let started = Instant::now();

        let body = self.request_body(messages);
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %self.cfg.model,
            messages = messages.len(),
            "sending model request"
        );
        tracing::debug!(body = %sanitized_for_log(&body), "request body (sanitized, base64 omitted)");

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ModelError::Cancelled),
            sent = req.send() => sent?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %message, "model server error");
            return Err(ModelError::ServerError {
                code: status.as_u16(),
                message,
            });
        }

        let (content, first_token_ms) = self.read_stream(response, &token, started).await?;
        let total_ms = started.elapsed().as_millis() as u64;

        if content.trim().is_empty() {
            return Err(ModelError::ParseError(content));
        }

        let (thinking, action) = action_parser::split_response(&content);
        tracing::info!(
            content_len = content.len(),
            has_action = !action.is_empty(),
            ttft_ms = ?first_token_ms,
            total_ms,
            "model stream complete"
        );

        Ok(ModelResponse {
            thinking,
            action,
            raw_content: content,
            time_to_first_token_ms: first_token_ms,
            total_time_ms: Some(total_ms),
        })
    }

    fn abort(&self) {
        if let Some(token) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            tracing::info!("aborting model request");
            token.cancel();
        }
    }
}
