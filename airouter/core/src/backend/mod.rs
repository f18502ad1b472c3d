//! Provider Backends
//!
//! Per-kind implementations of the [`ProviderBackend`] capability interface.

mod ollama;
mod openai;
mod traits;

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use traits::{
    BackendError, BackendSet, ChunkStream, Completion, ProviderBackend, UpstreamRequest,
};

use std::sync::Arc;

use crate::registry::{Provider, ProviderRegistry};
use crate::routing::config::ProviderKind;

/// Create the backend matching a provider's kind
///
/// # Errors
///
/// Fails if the HTTP client for the backend cannot be built.
pub fn create_backend(provider: &Provider) -> Result<Arc<dyn ProviderBackend>, BackendError> {
    Ok(match provider.kind {
        ProviderKind::Ollama => Arc::new(OllamaBackend::from_provider(provider)?),
        ProviderKind::OpenAi => Arc::new(OpenAiBackend::from_provider(provider)?),
    })
}

/// Create backends for every registered provider
///
/// # Errors
///
/// Fails on the first backend that cannot be built.
pub fn build_backends(registry: &ProviderRegistry) -> Result<BackendSet, BackendError> {
    registry
        .list_providers()
        .iter()
        .map(|p| Ok((p.id.clone(), create_backend(p)?)))
        .collect()
}
