//! OpenAI-compatible Backend
//!
//! Talks to anything exposing `/v1/chat/completions`: llama.cpp server, vLLM,
//! LM Studio and the hosted cloud APIs. Streaming bodies are already SSE, so
//! frames are forwarded byte for byte.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::traits::{
    truncate_body, BackendError, ChunkStream, Completion, ProviderBackend, UpstreamRequest,
};
use crate::protocol::Usage;
use crate::registry::Provider;

/// OpenAI-compatible backend client
#[derive(Clone)]
pub struct OpenAiBackend {
    base_url: String,
    health_path: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a backend for a base URL
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built (TLS backend init).
    pub fn new(
        base_url: impl Into<String>,
        health_path: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::Unreachable(format!("HTTP client init failed: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: health_path.into(),
            api_key,
            http_client,
        })
    }

    /// Create from a registry entry, reading the key from `api_key_env`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_provider(provider: &Provider) -> Result<Self, BackendError> {
        let api_key = provider.api_key_env.as_deref().and_then(|var| {
            let key = std::env::var(var).ok().filter(|k| !k.is_empty());
            if key.is_none() {
                tracing::warn!(provider = %provider.id, env = %var, "API key variable not set");
            }
            key
        });
        Self::new(&provider.base_url, &provider.health_path, api_key)
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn post(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let mut builder = self.http_client.post(self.url("/v1/chat/completions"));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

/// Join a base URL and an API path without doubling a `/v1` segment
pub(crate) fn join_url(base: &str, path: &str) -> String {
    if base.ends_with("/v1") && path.starts_with("/v1/") {
        format!("{}{}", &base[..base.len() - 3], path)
    } else {
        format!("{base}{path}")
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

#[async_trait]
impl ProviderBackend for OpenAiBackend {
    fn kind(&self) -> &'static str {
        "openai"
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let mut builder = self.http_client.get(self.url(&self.health_path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        error_for_status(response).await.map(|_| ())
    }

    async fn complete(&self, request: &UpstreamRequest) -> Result<Completion, BackendError> {
        let mut body = request.body.clone();
        body.stream = Some(false);

        let response = self.post(request).json(&body).send().await?;
        let response = error_for_status(response).await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        let usage = Usage::from_body(&body);

        Ok(Completion { body, usage })
    }

    async fn stream(&self, request: &UpstreamRequest) -> Result<ChunkStream, BackendError> {
        let mut body = request.body.clone();
        body.stream = Some(true);

        let response = self.post(request).json(&body).send().await?;
        let response = error_for_status(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BackendError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://gpu:8000", "/v1/chat/completions"),
            "http://gpu:8000/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.example.com/v1", "/v1/models"),
            "https://api.example.com/v1/models"
        );
        assert_eq!(join_url("http://gpu:11434", "/api/tags"), "http://gpu:11434/api/tags");
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        // Port 9 (discard) is closed on test machines
        let backend = OpenAiBackend::new("http://127.0.0.1:9", "/v1/models", None).unwrap();
        let err = backend.probe().await.unwrap_err();
        assert!(err.is_unreachable(), "unexpected error: {err:?}");
    }
}
