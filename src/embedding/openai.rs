/// OpenAI-compatible embeddings
///
/// Embeds the user's question so synthesized templates can rank rows by
/// distance to it. Works against any server speaking the `/embeddings` wire
/// format. text-embedding-3 models accept a `dimensions` field, which lets the
/// returned vector match a narrower pgvector column.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_vector, EmbeddingError, EmbeddingProvider};

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAIEmbeddingProvider {
    /// Fails with `NotConfigured` when `api_key` is blank, so a missing key
    /// surfaces at startup and the engine falls back to recency ordering.
    pub fn new(base_url: String, api_key: String, model: String, timeout_secs: u64) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::NotConfigured(
                "embedding provider 'openai' needs an API key: \
                 set VECQUERY_EMBEDDING__OPENAI_API_KEY or embedding.openai_api_key in vecquery.toml"
                    .to_string(),
            ));
        }

        Ok(OpenAIEmbeddingProvider {
            client: super::http_client(timeout_secs)?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
            dimensions: None,
        })
    }

    pub fn with_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.dimensions = dimensions;
        self
    }

    fn request<'a>(&'a self, question: &'a str) -> EmbeddingsRequest<'a> {
        EmbeddingsRequest {
            model: &self.model,
            input: question,
            encoding_format: "float",
            dimensions: self.dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request(text))
            .send()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("embeddings request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("unreadable embeddings response: {}", e)))?;

        // one input, so the vector is the item at index 0
        let vector = body
            .data
            .into_iter()
            .min_by_key(|item| item.index)
            .map(|item| item.embedding)
            .ok_or_else(|| EmbeddingError::Generation("embeddings response held no data".to_string()))?;
        check_vector(vector, self.dimensions)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAIEmbeddingProvider {
        OpenAIEmbeddingProvider::new(
            "https://llm.internal/v1/".to_string(),
            "sk-test".to_string(),
            "text-embedding-3-small".to_string(),
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_blank_key_is_not_configured() {
        let result = OpenAIEmbeddingProvider::new(
            "https://api.openai.com/v1".to_string(),
            "  ".to_string(),
            "text-embedding-3-small".to_string(),
            5,
        );
        assert!(matches!(result, Err(EmbeddingError::NotConfigured(_))));
    }

    #[test]
    fn test_request_shape() {
        let plain = provider();
        assert_eq!(plain.endpoint, "https://llm.internal/v1/embeddings");
        let body = serde_json::to_value(plain.request("latest grants")).unwrap();
        assert_eq!(body["input"], "latest grants");
        assert_eq!(body["encoding_format"], "float");
        assert!(body.get("dimensions").is_none());

        let narrow = provider().with_dimensions(Some(768));
        let body = serde_json::to_value(narrow.request("latest grants")).unwrap();
        assert_eq!(body["dimensions"], 768);
    }
}
