//! Ollama Backend Implementation
//!
//! Uses Ollama's native API so requests keep working on installs where the
//! OpenAI shim is disabled.
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions, NDJSON when streaming
//! - `/api/tags` - List installed models (used as the health probe)
//!
//! Responses are translated into OpenAI `chat.completion` objects and
//! `chat.completion.chunk` SSE frames so clients never see the difference.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::openai::join_url;
use super::traits::{
    truncate_body, BackendError, ChunkStream, Completion, ProviderBackend, UpstreamRequest,
};
use crate::protocol::{sse_frame, ChatCompletionRequest, Usage, SSE_DONE};
use crate::registry::Provider;

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    health_path: String,
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a backend for a base URL (e.g. `http://192.168.1.50:11434`)
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, health_path: impl Into<String>) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::Unreachable(format!("HTTP client init failed: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: health_path.into(),
            http_client,
        })
    }

    /// Create from a registry entry
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_provider(provider: &Provider) -> Result<Self, BackendError> {
        Self::new(&provider.base_url, &provider.health_path)
    }

    fn chat_url(&self) -> String {
        join_url(&self.base_url, "/api/chat")
    }

    async fn send_chat(&self, request: &UpstreamRequest, stream: bool) -> Result<reqwest::Response, BackendError> {
        let mut builder = self
            .http_client
            .post(self.chat_url())
            .json(&chat_body(&request.model, &request.body, stream));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status,
                body: truncate_body(&body),
            });
        }
        Ok(response)
    }
}

// ============================================================================
// Request Translation
// ============================================================================

/// Build an `/api/chat` body from an OpenAI request
fn chat_body(model: &str, request: &ChatCompletionRequest, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let (text, images) = split_content(&m.content);
            let mut message = json!({ "role": m.role, "content": text });
            if !images.is_empty() {
                message["images"] = json!(images);
            }
            message
        })
        .collect();

    let mut options = Map::new();
    if let Some(t) = request.temperature {
        options.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = request.top_p {
        options.insert("top_p".to_string(), json!(p));
    }
    if let Some(n) = request.max_tokens {
        options.insert("num_predict".to_string(), json!(n));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    });
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    body
}

/// Flatten OpenAI content parts into text plus base64 images
fn split_content(content: &Value) -> (String, Vec<String>) {
    match content {
        Value::String(s) => (s.clone(), Vec::new()),
        Value::Array(parts) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                    }
                    Some("image_url") => {
                        let url = part
                            .pointer("/image_url/url")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        // Ollama only accepts inline base64
                        if let Some((_, data)) = url.split_once("base64,") {
                            images.push(data.to_string());
                        }
                    }
                    _ => {}
                }
            }
            (text, images)
        }
        _ => (String::new(), Vec::new()),
    }
}

// ============================================================================
// Response Translation
// ============================================================================

fn usage_from(data: &Value) -> Option<Usage> {
    let prompt = data.get("prompt_eval_count").and_then(Value::as_u64);
    let completion = data.get("eval_count").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    let prompt_tokens = prompt.unwrap_or(0);
    let completion_tokens = completion.unwrap_or(0);
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

fn finish_reason(data: &Value) -> &str {
    match data.get("done_reason").and_then(Value::as_str) {
        Some("length") => "length",
        _ => "stop",
    }
}

/// Convert a non-streaming `/api/chat` response
fn completion_from(request_id: &str, model: &str, data: &Value) -> Completion {
    let content = data
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let usage = usage_from(data);

    let mut body = json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason(data),
        }],
    });
    if let Some(usage) = usage {
        body["usage"] = json!(usage);
    }

    Completion { body, usage }
}

/// Incremental NDJSON to SSE translator
struct ChunkTranslator {
    id: String,
    model: String,
    created: i64,
    buffer: Vec<u8>,
    sent_role: bool,
    done: bool,
}

impl ChunkTranslator {
    fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            buffer: Vec::new(),
            sent_role: false,
            done: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Usage>) -> Bytes {
        let mut payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
        });
        if let Some(usage) = usage {
            payload["usage"] = json!(usage);
        }
        Bytes::from(sse_frame(&payload))
    }

    /// Feed raw bytes; returns the frames completed by them
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, BackendError> {
        // Lines are decoded whole so characters split across reads survive
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() || self.done {
                continue;
            }
            let data: Value =
                serde_json::from_slice(line).map_err(|e| BackendError::Decode(e.to_string()))?;
            if let Some(error) = data.get("error").and_then(Value::as_str) {
                return Err(BackendError::Decode(error.to_string()));
            }
            frames.extend(self.translate(&data));
        }
        Ok(frames)
    }

    fn translate(&mut self, data: &Value) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let token = data
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !self.sent_role {
            self.sent_role = true;
            frames.push(self.chunk(json!({ "role": "assistant", "content": token }), None, None));
        } else if !token.is_empty() {
            frames.push(self.chunk(json!({ "content": token }), None, None));
        }

        if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
            self.done = true;
            frames.push(self.chunk(json!({}), Some(finish_reason(data)), usage_from(data)));
            frames.push(Bytes::from_static(SSE_DONE.as_bytes()));
        }
        frames
    }

    /// Frames to emit when the upstream closes the body
    fn finish(&mut self) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        // Upstream hung up without a done line
        vec![
            self.chunk(json!({}), Some("stop"), None),
            Bytes::from_static(SSE_DONE.as_bytes()),
        ]
    }
}

#[async_trait]
impl ProviderBackend for OllamaBackend {
    fn kind(&self) -> &'static str {
        "ollama"
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let response = self
            .http_client
            .get(join_url(&self.base_url, &self.health_path))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }

    async fn complete(&self, request: &UpstreamRequest) -> Result<Completion, BackendError> {
        let response = self.send_chat(request, false).await?;
        let data: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(completion_from(&request.request_id, &request.model, &data))
    }

    async fn stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, BackendError> {
        let response = self.send_chat(request, true).await?;
        let mut upstream = response.bytes_stream();
        let mut translator = ChunkTranslator::new(&request.request_id, &request.model);
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    chunk = upstream.next() => chunk,
                    // Consumer went away, drop the upstream connection
                    () = tx.closed() => return,
                };

                let frames = match chunk {
                    Some(Ok(bytes)) => translator.push(&bytes),
                    Some(Err(e)) => Err(BackendError::from(e)),
                    None => Ok(translator.finish()),
                };
                let finished = translator.done;

                match frames {
                    Ok(frames) => {
                        for frame in frames {
                            if tx.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }

                if finished {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
