//! Test doubles for routing components
//!
//! [`FakeBackend`] is a scriptable [`ProviderBackend`]: probe results,
//! completion behaviour and stream frames are set per test, and every call is
//! recorded. Nothing here sleeps; slow upstreams are modelled with pending
//! futures and [`Notify`] gates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use crate::backend::{BackendError, ChunkStream, Completion, ProviderBackend, UpstreamRequest};
use crate::protocol::{sse_frame, Usage, SSE_DONE};
use crate::registry::{Model, Provider, ProviderRegistry, RegistryHandle};
use crate::routing::config::{ProviderKind, ProviderTier};

/// How a [`FakeBackend`] answers completions
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    /// Answer immediately
    Respond,
    /// Connection refused
    Unreachable,
    /// Connection dropped after the request was sent
    Dropped,
    /// Non-2xx upstream status
    Status(u16),
    /// Never answer
    Hang,
    /// Answer once the gate is notified
    Gated(Arc<Notify>),
    /// Stream these content deltas, then `[DONE]`
    Stream(Vec<String>),
    /// Stream these deltas, then fail
    StreamThenFail(Vec<String>),
    /// Stream these deltas, then stall forever
    StreamThenHang(Vec<String>),
}

/// Scriptable backend
pub(crate) struct FakeBackend {
    scripted_probes: Mutex<VecDeque<bool>>,
    fail_probes: AtomicBool,
    hang_probes: AtomicBool,
    probe_count: AtomicUsize,
    probed: Notify,
    behavior: Mutex<Behavior>,
    calls: Mutex<Vec<UpstreamRequest>>,
    called: Notify,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            scripted_probes: Mutex::new(VecDeque::new()),
            fail_probes: AtomicBool::new(false),
            hang_probes: AtomicBool::new(false),
            probe_count: AtomicUsize::new(0),
            probed: Notify::new(),
            behavior: Mutex::new(Behavior::Respond),
            calls: Mutex::new(Vec::new()),
            called: Notify::new(),
        })
    }

    pub(crate) fn with_behavior(behavior: Behavior) -> Arc<Self> {
        let backend = Self::new();
        backend.set_behavior(behavior);
        backend
    }

    /// Results for the next probes, in order; afterwards `fail_probes` applies
    pub(crate) fn script_probes(&self, results: &[bool]) {
        self.scripted_probes.lock().extend(results.iter().copied());
    }

    pub(crate) fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn hang_probes(&self, hang: bool) {
        self.hang_probes.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_probes(&self, n: usize) {
        loop {
            let notified = self.probed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.probe_count() >= n {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().clone()
    }

    pub(crate) async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.called.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.call_count() >= n {
                return;
            }
            notified.await;
        }
    }

    fn record_call(&self, request: &UpstreamRequest) -> Behavior {
        self.calls.lock().push(request.clone());
        self.called.notify_waiters();
        self.behavior.lock().clone()
    }

    fn completion_body(request: &UpstreamRequest) -> Completion {
        let usage = Usage {
            prompt_tokens: 3,
            completion_tokens: 5,
            total_tokens: 8,
        };
        Completion {
            body: json!({
                "id": format!("chatcmpl-{}", request.request_id),
                "object": "chat.completion",
                "model": request.model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }],
                "usage": usage,
            }),
            usage: Some(usage),
        }
    }

    fn delta_frames(model: &str, deltas: Vec<String>) -> Vec<Result<Bytes, BackendError>> {
        deltas
            .into_iter()
            .map(|content| {
                let chunk = json!({
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{"index": 0, "delta": {"content": content}}]
                });
                Ok(Bytes::from(sse_frame(&chunk)))
            })
            .collect()
    }
}

#[async_trait]
impl ProviderBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let scripted = self.scripted_probes.lock().pop_front();
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        self.probed.notify_waiters();

        if self.hang_probes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let ok = scripted.unwrap_or_else(|| !self.fail_probes.load(Ordering::SeqCst));
        if ok {
            Ok(())
        } else {
            Err(BackendError::Unreachable("connection refused".to_string()))
        }
    }

    async fn complete(&self, request: &UpstreamRequest) -> Result<Completion, BackendError> {
        match self.record_call(request) {
            Behavior::Respond | Behavior::Stream(_) => Ok(Self::completion_body(request)),
            Behavior::Unreachable
            | Behavior::StreamThenFail(_)
            | Behavior::StreamThenHang(_) => {
                Err(BackendError::Unreachable("connection refused".to_string()))
            }
            Behavior::Dropped => Err(BackendError::Transport("connection reset".to_string())),
            Behavior::Status(status) => Err(BackendError::Status {
                status,
                body: "upstream exploded".to_string(),
            }),
            Behavior::Hang => std::future::pending().await,
            Behavior::Gated(gate) => {
                gate.notified().await;
                Ok(Self::completion_body(request))
            }
        }
    }

    async fn stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, BackendError> {
        match self.record_call(request) {
            Behavior::Respond => Ok(futures::stream::iter(vec![Ok(Bytes::from(SSE_DONE))]).boxed()),
            Behavior::Stream(deltas) => {
                let mut frames = Self::delta_frames(&request.model, deltas);
                frames.push(Ok(Bytes::from(SSE_DONE)));
                Ok(futures::stream::iter(frames).boxed())
            }
            Behavior::StreamThenFail(deltas) => {
                let mut frames = Self::delta_frames(&request.model, deltas);
                frames.push(Err(BackendError::Transport("connection reset".to_string())));
                Ok(futures::stream::iter(frames).boxed())
            }
            Behavior::StreamThenHang(deltas) => {
                let frames = Self::delta_frames(&request.model, deltas);
                Ok(futures::stream::iter(frames)
                    .chain(futures::stream::pending())
                    .boxed())
            }
            Behavior::Unreachable => Err(BackendError::Unreachable("connection refused".to_string())),
            Behavior::Dropped => Err(BackendError::Transport("connection reset".to_string())),
            Behavior::Status(status) => Err(BackendError::Status {
                status,
                body: "upstream exploded".to_string(),
            }),
            Behavior::Hang => std::future::pending().await,
            Behavior::Gated(gate) => {
                gate.notified().await;
                Ok(futures::stream::iter(vec![Ok(Bytes::from(SSE_DONE))]).boxed())
            }
        }
    }
}

/// Provider builder for tests
pub(crate) struct TestProvider(Provider);

impl TestProvider {
    /// Local Ollama-style provider serving `llama3`
    pub(crate) fn local(id: &str, priority: u32, max_concurrent: u32) -> Self {
        Self(Provider {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            max_concurrent,
            tier: ProviderTier::Local,
            kind: ProviderKind::Ollama,
            base_url: format!("http://{id}.lan:11434"),
            health_path: "/api/tags".to_string(),
            api_key_env: None,
            models: vec![model("llama3", true)],
        })
    }

    /// Cloud provider serving `gpt-4o-mini`
    pub(crate) fn cloud(id: &str, priority: u32, max_concurrent: u32) -> Self {
        Self(Provider {
            tier: ProviderTier::Cloud,
            kind: ProviderKind::OpenAi,
            base_url: format!("https://{id}.example.com"),
            health_path: "/v1/models".to_string(),
            models: vec![model("gpt-4o-mini", true)],
            ..Self::local(id, priority, max_concurrent).0
        })
    }

    /// Replace the served models; the first is the default
    pub(crate) fn models(mut self, ids: &[&str]) -> Self {
        self.0.models = ids
            .iter()
            .enumerate()
            .map(|(i, id)| model(id, i == 0))
            .collect();
        self
    }

    pub(crate) fn build(self) -> Provider {
        self.0
    }
}

fn model(id: &str, is_default: bool) -> Model {
    Model {
        id: id.to_string(),
        name: id.to_string(),
        context_window: None,
        capabilities: vec!["chat".to_string()],
        is_default,
    }
}

/// Registry over test providers, all enabled
pub(crate) fn registry_of(providers: Vec<TestProvider>) -> RegistryHandle {
    ProviderRegistry::new(providers.into_iter().map(TestProvider::build).collect()).into_handle()
}
