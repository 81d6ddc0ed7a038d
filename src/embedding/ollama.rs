/// Ollama embedding provider
///
/// Calls the Ollama /api/embed endpoint. No API key required.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: Option<usize>,
}

impl OllamaEmbeddingProvider {
    pub fn new(base_url: String, model: String, timeout_secs: u64) -> Result<Self, EmbeddingError> {
        Ok(OllamaEmbeddingProvider {
            client: super::http_client(timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions: None,
        })
    }

    /// Checked only; Ollama models have a fixed output width.
    pub fn with_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.dimensions = dimensions;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = OllamaEmbedRequest {
            model: &self.model,
            input: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbeddingError::Api { status, message: body });
        }

        let parsed: OllamaEmbedResponse = response.json().await.map_err(|e| {
            EmbeddingError::Generation(format!("Failed to parse Ollama response: {}", e))
        })?;

        let vector = parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Generation("Ollama returned no embedding".to_string()))?;
        super::check_vector(vector, self.dimensions)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
