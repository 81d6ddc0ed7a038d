/// Ollama synthesis provider
///
/// Calls the Ollama /api/chat endpoint with temperature 0.
/// No API key required; designed for self-hosted Ollama deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    build_repair_prompt, build_synthesis_prompt, template_from_output, Constraint,
    QuerySynthesizer, RepairStep, SynthesisError,
};
use crate::query::QueryTemplate;

// --- HTTP request/response structs ---

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

// --- Provider ---

pub struct OllamaSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    schema: String,
}

impl OllamaSynthesizer {
    /// Create a new OllamaSynthesizer.
    ///
    /// # Arguments
    /// * `base_url` - Ollama server base URL (e.g., "http://localhost:11434")
    /// * `model` - Model name (e.g., "llama3.1:8b")
    pub fn new(base_url: String, model: String, schema: String, timeout_secs: u64) -> Result<Self, SynthesisError> {
        Ok(OllamaSynthesizer {
            client: super::http_client(timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            schema,
        })
    }

    /// POST to Ollama /api/chat with a given prompt, return content string.
    async fn chat(&self, prompt: String) -> Result<String, SynthesisError> {
        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: prompt,
            }],
            stream: false,
            options: OllamaOptions { temperature: 0.0 },
        };

        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SynthesisError::Generation(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SynthesisError::Api { status, message: body });
        }

        let chat_response: OllamaChatResponse = response.json().await.map_err(|e| {
            SynthesisError::Generation(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl QuerySynthesizer for OllamaSynthesizer {
    async fn synthesize(
        &self,
        question: &str,
        context: &str,
        constraint: Constraint,
    ) -> Result<QueryTemplate, SynthesisError> {
        let prompt = build_synthesis_prompt(question, &self.schema, context, constraint);
        let content = self.chat(prompt).await?;
        template_from_output(&content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl RepairStep for OllamaSynthesizer {
    async fn repair(
        &self,
        question: &str,
        failed: &QueryTemplate,
        reason: &str,
        schema: &str,
    ) -> Result<Option<QueryTemplate>, SynthesisError> {
        let prompt = build_repair_prompt(question, failed, reason, schema);
        let content = self.chat(prompt).await?;
        Ok(template_from_output(&content).ok())
    }
}
