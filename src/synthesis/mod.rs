/// Query synthesis and repair provider traits
///
/// A synthesizer turns a natural-language question into a SQL template,
/// optionally under a `Constraint` chosen by the escalation ladder. A repair
/// step rewrites a template the database rejected. Both are LLM-backed
/// (OpenAI-compatible chat completions or Ollama); the prompts live here so
/// every provider sends the same instructions.

pub mod ollama;
pub mod openai;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::SynthesisConfig;
use crate::errors::VecqueryError;
use crate::query::{sql, QueryTemplate, PLACEHOLDER};

/// Errors that can occur during synthesis or repair.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Transport failure or unusable model output
    #[error("Synthesis generation error: {0}")]
    Generation(String),

    /// API provider returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider not configured (e.g., missing API key or model)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl SynthesisError {
    /// Whether the external API breaker should count this error.
    pub fn is_outage(&self) -> bool {
        !matches!(self, SynthesisError::NotConfigured(_))
    }
}

/// Extra instruction attached to a synthesis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    None,
    /// Relax predicates, cap result size, prefer ILIKE matching
    Broaden,
    /// No similarity placeholder; recency ordering and keyword matching
    ForbidSimilarity,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::None => write!(f, "none"),
            Constraint::Broaden => write!(f, "broaden"),
            Constraint::ForbidSimilarity => write!(f, "forbid_similarity"),
        }
    }
}

/// Produces a SQL template for a question.
#[async_trait]
pub trait QuerySynthesizer: Send + Sync {
    /// `context` carries prior-attempt information (previous statement, failure reason).
    async fn synthesize(
        &self,
        question: &str,
        context: &str,
        constraint: Constraint,
    ) -> Result<QueryTemplate, SynthesisError>;

    fn model_name(&self) -> &str;
}

/// Rewrites a failed template. `Ok(None)` means no repair was produced.
#[async_trait]
pub trait RepairStep: Send + Sync {
    async fn repair(
        &self,
        question: &str,
        failed: &QueryTemplate,
        reason: &str,
        schema: &str,
    ) -> Result<Option<QueryTemplate>, SynthesisError>;
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// Instruction text for each constraint.
pub fn constraint_instructions(constraint: Constraint) -> String {
    match constraint {
        Constraint::None => format!(
            "When ranking by semantic relevance, order by `embedding <-> '{0}'::vector` \
             and keep the placeholder {0} exactly as written.",
            PLACEHOLDER
        ),
        Constraint::Broaden => "Broaden results: minimize restrictive filters and prefer recency \
             ordering. Limit result size to at most 100 rows and avoid selecting large blob fields. \
             Consider alternative proxies for the user's concept (counts, lengths, recency). \
             Use ILIKE for text matching instead of exact matches."
            .to_string(),
        Constraint::ForbidSimilarity => format!(
            "Do not use embedding similarity and do not use the {} placeholder. \
             Order by recency (created_at DESC) and match text with ILIKE patterns. \
             Choose an appropriate LIMIT for the question's scope.",
            PLACEHOLDER
        ),
    }
}

/// Build the synthesis prompt.
pub fn build_synthesis_prompt(question: &str, schema: &str, context: &str, constraint: Constraint) -> String {
    let mut prompt = String::from(
        "You write a single read-only PostgreSQL SELECT statement answering the user's question.\n\
         Output only the SQL inside a ```sql fenced block. Do not add commentary.\n",
    );
    if !schema.trim().is_empty() {
        prompt.push_str("\nSchema:\n");
        prompt.push_str(schema.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nInstructions:\n");
    prompt.push_str(&constraint_instructions(constraint));
    prompt.push('\n');
    if !context.trim().is_empty() {
        prompt.push_str("\nContext:\n");
        prompt.push_str(context.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nQuestion: ");
    prompt.push_str(question.trim());
    prompt
}

/// Build the repair prompt. The failed statement is shown redacted.
pub fn build_repair_prompt(question: &str, failed: &QueryTemplate, reason: &str, schema: &str) -> String {
    let mut prompt = format!(
        "Repair the following SQL for a PostgreSQL database. Ensure it is a single read-only \
         SELECT, syntactically valid and aligned with the schema. Keep any {} \
         placeholder exactly as written.\n\
         Output only the SQL inside a ```sql fenced block.\n\n\
         User query:\n{}\n\n\
         Previous SQL:\n```sql\n{}\n```\n\n\
         Error:\n{}\n",
        PLACEHOLDER,
        question.trim(),
        sql::redact(failed.raw_text()),
        sql::redact(reason),
    );
    if !schema.trim().is_empty() {
        prompt.push_str("\nSchema:\n");
        prompt.push_str(schema.trim());
        prompt.push('\n');
    }
    prompt
}

/// Turn raw model output into a template.
pub fn template_from_output(output: &str) -> Result<QueryTemplate, SynthesisError> {
    sql::extract_sql(output)
        .map(QueryTemplate::new)
        .ok_or_else(|| SynthesisError::Generation("model output contained no SQL statement".to_string()))
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Stand-in used when no provider is configured, so the server still starts.
pub struct UnconfiguredSynthesizer {
    reason: String,
}

impl UnconfiguredSynthesizer {
    pub fn new(reason: impl Into<String>) -> Self {
        UnconfiguredSynthesizer { reason: reason.into() }
    }
}

#[async_trait]
impl QuerySynthesizer for UnconfiguredSynthesizer {
    async fn synthesize(&self, _question: &str, _context: &str, _constraint: Constraint) -> Result<QueryTemplate, SynthesisError> {
        Err(SynthesisError::NotConfigured(self.reason.clone()))
    }

    fn model_name(&self) -> &str {
        "unconfigured"
    }
}

#[async_trait]
impl RepairStep for UnconfiguredSynthesizer {
    async fn repair(&self, _question: &str, _failed: &QueryTemplate, _reason: &str, _schema: &str) -> Result<Option<QueryTemplate>, SynthesisError> {
        Err(SynthesisError::NotConfigured(self.reason.clone()))
    }
}

/// Synthesizer and repair step sharing one provider.
pub type SynthesisPair = (Arc<dyn QuerySynthesizer>, Arc<dyn RepairStep>);

/// Build the configured providers. A provider that cannot be configured
/// yields the unconfigured stand-in and a warning.
pub fn build_providers(config: &SynthesisConfig, schema: &str) -> SynthesisPair {
    let built: Result<SynthesisPair, SynthesisError> = match config.provider.as_str() {
        "openai" => openai::OpenAISynthesizer::new(
            config.openai_base_url.clone(),
            config.openai_api_key.clone().unwrap_or_default(),
            config.openai_model.clone(),
            schema.to_string(),
            config.timeout_secs,
        )
        .map(|p| {
            let p = Arc::new(p);
            (p.clone() as Arc<dyn QuerySynthesizer>, p as Arc<dyn RepairStep>)
        }),
        "ollama" => ollama::OllamaSynthesizer::new(
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
            schema.to_string(),
            config.timeout_secs,
        )
        .map(|p| {
            let p = Arc::new(p);
            (p.clone() as Arc<dyn QuerySynthesizer>, p as Arc<dyn RepairStep>)
        }),
        other => Err(SynthesisError::NotConfigured(format!(
            "Unknown synthesis provider '{}': expected openai or ollama",
            other
        ))),
    };

    built.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Query synthesis unavailable");
        let stand_in = Arc::new(UnconfiguredSynthesizer::new(e.to_string()));
        (stand_in.clone() as Arc<dyn QuerySynthesizer>, stand_in as Arc<dyn RepairStep>)
    })
}

/// Read the schema description handed to synthesis and repair.
pub fn load_schema(config: &SynthesisConfig) -> Result<String, VecqueryError> {
    match &config.schema_path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| VecqueryError::Config(format!("Failed to read schema file {}: {}", path, e))),
        None => Ok(String::new()),
    }
}

/// HTTP client with the configured request timeout.
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, SynthesisError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| SynthesisError::NotConfigured(format!("HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_carry_constraint_and_context() {
        let prompt = build_synthesis_prompt(
            "recent aave proposals",
            "internal.unified_proposals(proposal_id, title, created_at)",
            "Previous SQL: SELECT 1\nReason: returned no rows",
            Constraint::Broaden,
        );
        assert!(prompt.contains("ILIKE"));
        assert!(prompt.contains("unified_proposals"));
        assert!(prompt.contains("returned no rows"));
        assert!(prompt.ends_with("Question: recent aave proposals"));

        let forbid = build_synthesis_prompt("q", "", "", Constraint::ForbidSimilarity);
        assert!(forbid.contains("do not use the {prompt_vector} placeholder"));
        assert!(!forbid.contains("Schema:"));
    }

    #[test]
    fn test_repair_prompt_redacts_vectors() {
        let failed = QueryTemplate::new(format!(
            "SELECT * FROM t ORDER BY e <-> '[{}]'::vector",
            vec!["0.5"; 64].join(",")
        ));
        let prompt = build_repair_prompt("q", &failed, "syntax error at or near \"FORM\"", "");
        assert!(prompt.contains("[REDACTED_EMBEDDING]"));
        assert!(prompt.contains("syntax error"));
    }

    #[test]
    fn test_template_from_output() {
        let t = template_from_output("Here you go:\n```sql\nSELECT title FROM p ORDER BY e <-> '{prompt_vector}'::vector LIMIT 5;\n```").unwrap();
        assert!(t.has_similarity_placeholder());
        assert!(t.raw_text().starts_with("SELECT title"));
        assert!(template_from_output("```sql\n```").is_err());
    }

    #[tokio::test]
    async fn test_unknown_provider_yields_stand_in() {
        let config = SynthesisConfig {
            provider: "parrot".to_string(),
            ..SynthesisConfig::default()
        };
        let (synth, repair) = build_providers(&config, "");
        assert_eq!(synth.model_name(), "unconfigured");
        let err = synth.synthesize("q", "", Constraint::None).await.unwrap_err();
        assert!(!err.is_outage());
        let failed = QueryTemplate::new("SELECT 1");
        assert!(repair.repair("q", &failed, "r", "").await.is_err());
    }
}
