/// Embedding provider trait and supporting types
///
/// The question embedding drives similarity ordering. Providers are optional:
/// with none configured (or when a call fails) templates fall back to
/// recency ordering.

pub mod ollama;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Embedding generation failure (transport or malformed response)
    #[error("Embedding generation error: {0}")]
    Generation(String),

    /// API provider returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider not configured (e.g., missing API key)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// Core trait for embedding text into fixed-dimension float vectors.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn EmbeddingProvider>).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Return the model name identifier (e.g., "text-embedding-3-small").
    fn model_name(&self) -> &str;
}

/// Build the configured provider. `Ok(None)` means similarity is disabled.
pub fn build_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>, EmbeddingError> {
    match config.provider.as_str() {
        "openai" => {
            let provider = openai::OpenAIEmbeddingProvider::new(
                config.openai_base_url.clone(),
                config.openai_api_key.clone().unwrap_or_default(),
                config.openai_model.clone(),
                config.timeout_secs,
            )?
            .with_dimensions(config.dimensions);
            Ok(Some(Arc::new(provider)))
        }
        "ollama" => {
            let provider = ollama::OllamaEmbeddingProvider::new(
                config.ollama_base_url.clone(),
                config.ollama_model.clone(),
                config.timeout_secs,
            )?
            .with_dimensions(config.dimensions);
            Ok(Some(Arc::new(provider)))
        }
        "none" | "" => Ok(None),
        other => Err(EmbeddingError::NotConfigured(format!(
            "Unknown embedding provider '{}': expected openai, ollama or none",
            other
        ))),
    }
}

/// A vector the database can compare against: non-empty, finite, and as wide
/// as the stored column when that width is known.
pub(crate) fn check_vector(vector: Vec<f32>, dimensions: Option<usize>) -> Result<Vec<f32>, EmbeddingError> {
    if vector.is_empty() {
        return Err(EmbeddingError::Generation("provider returned an empty vector".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::Generation("provider returned non-finite values".to_string()));
    }
    match dimensions {
        Some(expected) if expected != vector.len() => Err(EmbeddingError::Generation(format!(
            "expected {} dimensions, provider returned {}",
            expected,
            vector.len()
        ))),
        _ => Ok(vector),
    }
}

/// HTTP client with the configured request timeout.
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, EmbeddingError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| EmbeddingError::NotConfigured(format!("HTTP client: {}", e)))
}
