use rmcp::{
    ServerHandler,
    tool,
    model::{ServerCapabilities, Implementation, ProtocolVersion, CallToolResult},
    handler::server::wrapper::Parameters,
    ErrorData as McpError,
};
use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::VecqueryError;
use crate::escalation::{Engine, Outcome};
use crate::pool::PgConnector;

pub struct QueryService {
    engine: Arc<Engine<PgConnector>>,
    start_time: Instant,
}

impl QueryService {
    pub fn new(engine: Arc<Engine<PgConnector>>) -> Self {
        Self {
            engine,
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// Parameter structs

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct QueryDatabaseParams {
    /// Natural-language question about the data (required)
    pub question: String,
    /// Include the per-attempt trail in the response (default: true)
    pub include_attempts: Option<bool>,
}

// Helper: convert VecqueryError to CallToolResult with isError: true
fn error_to_result(err: VecqueryError) -> CallToolResult {
    match err {
        VecqueryError::Validation { message, field } => {
            let mut obj = json!({
                "isError": true,
                "error": message,
            });
            if let Some(f) = field {
                obj["field"] = json!(f);
            }
            CallToolResult::structured_error(obj)
        }
        other => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": other.to_string()
            }))
        }
    }
}

// Helper: render an outcome, flagging failures with isError: true
fn outcome_to_result(outcome: &Outcome, include_attempts: bool) -> CallToolResult {
    let mut value = match serde_json::to_value(outcome) {
        Ok(value) => value,
        Err(e) => {
            return error_to_result(VecqueryError::Internal(format!("Failed to serialize outcome: {}", e)));
        }
    };
    if !include_attempts {
        if let Some(obj) = value.as_object_mut() {
            obj.remove("attempts");
        }
    }

    match outcome {
        Outcome::Failed { .. } => {
            value["isError"] = json!(true);
            CallToolResult::structured_error(value)
        }
        _ => CallToolResult::structured(value),
    }
}

// Tool implementations
#[rmcp::tool_router]
impl QueryService {
    #[tool(description = "Answer a natural-language question from the database. Synthesizes SQL, runs it with similarity or recency ordering, and escalates through broader strategies when nothing comes back. Returns rows, a no-results outcome with a suggested web search, or a classified failure.")]
    async fn query_database(
        &self,
        Parameters(params): Parameters<QueryDatabaseParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "query_database", "Tool called");

        if params.question.trim().is_empty() {
            return Ok(error_to_result(VecqueryError::validation(
                "question",
                "Field 'question' is required and cannot be empty",
            )));
        }

        let outcome = self.engine.answer(&params.question).await;
        Ok(outcome_to_result(&outcome, params.include_attempts.unwrap_or(true)))
    }

    #[tool(description = "Show connection pool statistics and circuit breaker states")]
    async fn engine_status(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "engine_status", "Tool called");

        let status = self.engine.status().await;
        let value = serde_json::to_value(&status)
            .map_err(|e| McpError::internal_error(format!("Failed to serialize status: {}", e), None))?;
        Ok(CallToolResult::structured(value))
    }

    #[tool(description = "Check server health and status")]
    async fn health_check(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "health_check", "Tool called");

        let status = self.engine.status().await;
        let breakers: serde_json::Map<String, serde_json::Value> = status
            .breakers
            .iter()
            .map(|b| (b.name.clone(), json!(b.state)))
            .collect();

        let response = json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.uptime_seconds(),
            "pool_in_backoff": status.pool.in_backoff,
            "breakers": breakers,
        });

        Ok(CallToolResult::structured(response))
    }
}

#[rmcp::tool_handler(router = Self::tool_router())]
impl ServerHandler for QueryService {
    fn get_info(&self) -> rmcp::model::InitializeResult {
        rmcp::model::InitializeResult {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "vecquery".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some("Resilient vector-aware SQL execution engine for LLM agents".to_string()),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Query engine for AI agents. Tools: query_database (question -> rows, no_results with a search hint, or a classified failure), engine_status (pool and circuit breakers), health_check.".to_string()
            ),
        }
    }
}
