/// OpenAI-compatible synthesis provider
///
/// Calls any OpenAI-compatible Chat Completions API. The base_url is
/// configurable, so OpenAI and compatible endpoints both work.
/// Requires an API key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    build_repair_prompt, build_synthesis_prompt, template_from_output, Constraint,
    QuerySynthesizer, RepairStep, SynthesisError,
};
use crate::query::QueryTemplate;

// --- HTTP request/response structs ---

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

// --- Provider ---

pub struct OpenAISynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    schema: String,
}

impl OpenAISynthesizer {
    /// Create a new OpenAISynthesizer.
    ///
    /// # Errors
    /// Returns `SynthesisError::NotConfigured` if api_key is empty.
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        schema: String,
        timeout_secs: u64,
    ) -> Result<Self, SynthesisError> {
        if api_key.trim().is_empty() {
            return Err(SynthesisError::NotConfigured(
                "OpenAI API key is required when using the openai synthesis provider. \
                 Set VECQUERY_SYNTHESIS__OPENAI_API_KEY or openai_api_key in vecquery.toml"
                    .to_string(),
            ));
        }

        Ok(OpenAISynthesizer {
            client: super::http_client(timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            schema,
        })
    }

    /// POST to {base_url}/chat/completions, return the first choice's content.
    async fn chat(&self, prompt: String) -> Result<String, SynthesisError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt,
            }],
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            SynthesisError::Generation(format!("Failed to parse OpenAI response: {}", e))
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| SynthesisError::Generation("OpenAI returned empty choices list".to_string()))
    }
}

#[async_trait]
impl QuerySynthesizer for OpenAISynthesizer {
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
impl RepairStep for OpenAISynthesizer {
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
