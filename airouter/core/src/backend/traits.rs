//! Provider Backend Traits
//!
//! The capability interface the router dispatches through. Each provider kind
//! (Ollama, OpenAI-compatible servers) implements [`ProviderBackend`]; the
//! router and health monitor only ever see `Arc<dyn ProviderBackend>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ChatCompletionRequest, Usage};

/// Backends keyed by provider id
pub type BackendSet = HashMap<String, Arc<dyn ProviderBackend>>;

/// Stream of ready-to-send SSE frames (`data: ...\n\n`)
pub type ChunkStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// A request addressed to one provider and model
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    /// Correlation id, also used for generated completion ids
    pub request_id: String,
    /// Upstream model id
    pub model: String,
    /// Client body with `model` rewritten
    pub body: ChatCompletionRequest,
    /// Pass-through headers (lowercase name, value)
    pub headers: Vec<(String, String)>,
}

/// A non-streaming completion
#[derive(Clone, Debug)]
pub struct Completion {
    /// OpenAI `chat.completion` object
    pub body: Value,
    /// Token accounting, when the upstream reported it
    pub usage: Option<Usage>,
}

/// Backend failures
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection refused or DNS failure; the upstream never saw the request
    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    /// Connection dropped after the request was sent
    #[error("Upstream connection failed: {0}")]
    Transport(String),

    /// No response within the allotted time
    #[error("Upstream timed out")]
    Timeout,

    /// Upstream answered with a non-2xx status
    #[error("Upstream returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Upstream answered with something we could not parse
    #[error("Invalid upstream response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether the failure happened before the upstream saw the request
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Short label for metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else if e.is_connect() {
            Self::Unreachable(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Capability interface implemented per provider kind
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Provider kind label ("ollama", "openai", ...)
    fn kind(&self) -> &'static str;

    /// Cheap reachability check used by the health monitor
    async fn probe(&self) -> Result<(), BackendError>;

    /// Run a completion and return the whole response
    async fn complete(&self, request: &UpstreamRequest) -> Result<Completion, BackendError>;

    /// Start a streamed completion
    ///
    /// Resolves once the upstream accepted the request; generation continues
    /// inside the returned stream.
    async fn stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, BackendError>;
}

/// Limit an upstream error body to something loggable
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
