//! Shared fixtures for the integration tests
//!
//! Mock upstreams are real axum servers on `127.0.0.1:0` so requests travel
//! through the production `OpenAiBackend` / `OllamaBackend` HTTP clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::ServiceExt;

use airouter_core::routing::{ModelConfig, ProviderConfig, ProviderKind, ProviderTier};
use airouter_core::{build_app, RouterSettings, Stack};

// ============================================================================
// Mock Upstream
// ============================================================================

/// How the mock answers chat requests
#[derive(Clone, Debug)]
pub enum Reply {
    /// Answer immediately
    Ok,
    /// Answer with this status and an error body
    Status(u16),
    /// Hold every request until [`MockUpstream::open_gate`]
    Gated,
}

/// A chat request the mock received
#[derive(Clone, Debug)]
pub struct ReceivedCall {
    /// Parsed body
    pub body: Value,
    /// Request headers
    pub headers: HeaderMap,
}

#[derive(Debug)]
struct MockState {
    reply: Mutex<Reply>,
    calls: Mutex<Vec<ReceivedCall>>,
    call_made: Notify,
    gate: Notify,
    gate_open: Mutex<bool>,
}

/// An OpenAI-compatible or Ollama upstream listening on a random local port
#[derive(Clone, Debug)]
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockUpstream {
    /// OpenAI-compatible server (`/v1/chat/completions`, `/v1/models`)
    pub async fn openai(reply: Reply) -> Self {
        let state = Self::state(reply);
        let app = axum::Router::new()
            .route("/v1/chat/completions", post(openai_chat))
            .route("/v1/models", get(|| async { Json(json!({"object": "list", "data": []})) }))
            .with_state(Arc::clone(&state));
        Self::serve(app, state).await
    }

    /// Ollama server (`/api/chat`, `/api/tags`)
    pub async fn ollama(reply: Reply) -> Self {
        let state = Self::state(reply);
        let app = axum::Router::new()
            .route("/api/chat", post(ollama_chat))
            .route("/api/tags", get(|| async { Json(json!({"models": []})) }))
            .with_state(Arc::clone(&state));
        Self::serve(app, state).await
    }

    fn state(reply: Reply) -> Arc<MockState> {
        Arc::new(MockState {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
            call_made: Notify::new(),
            gate: Notify::new(),
            gate_open: Mutex::new(false),
        })
    }

    async fn serve(app: axum::Router, state: Arc<MockState>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    /// Base URL to put in the provider config
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Change how later requests are answered
    pub fn set_reply(&self, reply: Reply) {
        *self.state.reply.lock() = reply;
    }

    /// Release every held request, now and later
    pub fn open_gate(&self) {
        *self.state.gate_open.lock() = true;
        self.state.gate.notify_waiters();
    }

    /// Requests received so far
    pub fn calls(&self) -> Vec<ReceivedCall> {
        self.state.calls.lock().clone()
    }

    /// Number of requests received so far
    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    /// Wait until at least `n` requests arrived
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.state.call_made.notified();
                if self.call_count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("upstream never received the expected calls");
    }
}

impl MockState {
    async fn record(&self, headers: HeaderMap, body: Value) -> Reply {
        self.calls.lock().push(ReceivedCall { body, headers });
        self.call_made.notify_waiters();

        let reply = self.reply.lock().clone();
        if matches!(reply, Reply::Gated) {
            loop {
                let opened = self.gate.notified();
                if *self.gate_open.lock() {
                    break;
                }
                opened.await;
            }
        }
        reply
    }
}

fn error_reply(status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": {"message": "mock failure"}}))).into_response()
}

fn text_body(content_type: &'static str, body: String) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn openai_chat(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let stream = body["stream"].as_bool().unwrap_or(false);
    let model = body["model"].as_str().unwrap_or_default().to_string();

    if let Reply::Status(code) = state.record(headers, body).await {
        return error_reply(code);
    }

    if stream {
        let mut frames = String::new();
        for token in ["Hel", "lo"] {
            let chunk = json!({
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{"index": 0, "delta": {"content": token}, "finish_reason": null}],
            });
            frames.push_str(&format!("data: {chunk}\n\n"));
        }
        let last = json!({
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6},
        });
        frames.push_str(&format!("data: {last}\n\ndata: [DONE]\n\n"));
        return text_body("text/event-stream", frames);
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6},
    }))
    .into_response()
}

async fn ollama_chat(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let stream = body["stream"].as_bool().unwrap_or(false);
    let model = body["model"].as_str().unwrap_or_default().to_string();

    if let Reply::Status(code) = state.record(headers, body).await {
        return error_reply(code);
    }

    if stream {
        let lines = [
            json!({"model": model, "message": {"role": "assistant", "content": "Hel"}, "done": false}),
            json!({"model": model, "message": {"role": "assistant", "content": "lo"}, "done": false}),
            json!({
                "model": model,
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 4,
                "eval_count": 2,
            }),
        ];
        let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
        return text_body("application/x-ndjson", body);
    }

    Json(json!({
        "model": model,
        "message": {"role": "assistant", "content": "Hello"},
        "done": true,
        "done_reason": "stop",
        "prompt_eval_count": 4,
        "eval_count": 2,
    }))
    .into_response()
}

// ============================================================================
// Router Fixtures
// ============================================================================

/// Provider entry pointing at `base_url`
pub fn provider(
    id: &str,
    priority: u32,
    max_concurrent: u32,
    kind: ProviderKind,
    base_url: &str,
    models: &[&str],
) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        name: Some(format!("Provider {id}")),
        priority,
        max_concurrent,
        enabled: true,
        tier: ProviderTier::Local,
        kind,
        base_url: base_url.to_string(),
        api_key_env: None,
        health_path: None,
        models: models
            .iter()
            .enumerate()
            .map(|(i, m)| ModelConfig {
                id: (*m).to_string(),
                name: None,
                context_window: Some(8192),
                capabilities: Vec::new(),
                is_default: i == 0,
            })
            .collect(),
    }
}

/// A base URL nothing listens on
pub const DEAD_URL: &str = "http://127.0.0.1:9";

/// Settings with default routing values over the given providers
pub fn settings(providers: Vec<ProviderConfig>) -> RouterSettings {
    let mut settings = RouterSettings::new();
    settings.providers = providers;
    settings.validate().unwrap();
    settings
}

/// Wire a stack and its app
pub fn app(settings: &RouterSettings) -> (axum::Router, Stack) {
    let stack = Stack::from_settings(settings).unwrap();
    let app = build_app(stack.app_state(None));
    (app, stack)
}

// ============================================================================
// Request Helpers
// ============================================================================

/// A chat body for `model`
pub fn chat(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
    })
}

/// POST JSON and return status, headers and parsed body
pub async fn post_json(
    app: &axum::Router,
    path: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    send(app, request).await
}

/// POST with an empty body (admin toggles)
pub async fn post_empty(app: &axum::Router, path: &str) -> (StatusCode, HeaderMap, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// GET and parse the body as JSON
pub async fn get_json(app: &axum::Router, path: &str) -> (StatusCode, HeaderMap, Value) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    send(app, request).await
}

/// GET and return the raw body text
pub async fn get_text(app: &axum::Router, path: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = body_bytes(response).await;
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = body_bytes(response).await;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, headers, body)
}

/// Collect a response body
pub async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}
