/// Escalation controller
///
/// `Engine::answer` turns one question into rows or a typed outcome. It
/// synthesizes a template, materializes it with the question embedding (or
/// the recency fallback), executes it, and on an empty result or a failure
/// walks the strategy ladder once. Fatal and pool-unavailable errors end the
/// walk immediately. A repairable error on the first rung gets one repair
/// attempt before the ladder moves on.

pub mod strategy;

use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::breaker::{BreakerError, BreakerStatus, CircuitBreaker};
use crate::config::{Config, EscalationConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::errors::VecqueryError;
use crate::executor::{ErrorClass, ExecError, QueryExecutor};
use crate::pool::{ConnectionPool, Connector, PoolStats};
use crate::query::{Materializer, QueryTemplate, RowSet};
use crate::synthesis::{self, Constraint, QuerySynthesizer, RepairStep, SynthesisError};

pub use strategy::{IdentifierMatch, IdentifierMatcher, Plan, Prior, Strategy};

/// Message surfaced with every fatal outcome.
pub const FATAL_ADVICE: &str = "try a simpler query or contact support";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// One materialize/execute step, or a rung that produced no statement.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub strategy_index: usize,
    pub strategy: Strategy,
    /// True for the single repair attempt of the first rung
    pub repair: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Executed statement, redacted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recency_fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionAttempt {
    fn new(strategy: Strategy, repair: bool) -> Self {
        ExecutionAttempt {
            strategy_index: strategy.index(),
            strategy,
            repair,
            template: None,
            statement: None,
            recency_fallback: None,
            rows: None,
            error: None,
            skipped: None,
            elapsed_ms: 0,
        }
    }
}

/// Result of `Engine::answer`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Rows {
        request_id: Uuid,
        strategy: Strategy,
        repaired: bool,
        /// Executed statement, redacted
        statement: String,
        recency_fallback: bool,
        result: RowSet,
        attempts: Vec<ExecutionAttempt>,
    },
    NoResults {
        request_id: Uuid,
        /// Last executed statement, redacted
        statement: Option<String>,
        /// Suggested query for an external search collaborator
        search_hint: String,
        attempts: Vec<ExecutionAttempt>,
    },
    Failed {
        request_id: Uuid,
        error: ExecError,
        message: String,
        attempts: Vec<ExecutionAttempt>,
    },
}

impl Outcome {
    pub fn request_id(&self) -> Uuid {
        match self {
            Outcome::Rows { request_id, .. }
            | Outcome::NoResults { request_id, .. }
            | Outcome::Failed { request_id, .. } => *request_id,
        }
    }

    pub fn attempts(&self) -> &[ExecutionAttempt] {
        match self {
            Outcome::Rows { attempts, .. }
            | Outcome::NoResults { attempts, .. }
            | Outcome::Failed { attempts, .. } => attempts,
        }
    }

    /// Build the failure outcome for a classified error.
    fn failed(request_id: Uuid, error: ExecError, attempts: Vec<ExecutionAttempt>) -> Self {
        let message = match error.class {
            ErrorClass::Fatal(_) => format!("The query failed with a {} error; {}.", error.class, FATAL_ADVICE),
            ErrorClass::PoolUnavailable => {
                "The database is temporarily unavailable; try again shortly.".to_string()
            }
            _ => format!("No strategy produced a result: {}", error.reason),
        };
        Outcome::Failed {
            request_id,
            error,
            message,
            attempts,
        }
    }
}

/// Pool and breaker snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub pool: PoolStats,
    pub breakers: Vec<BreakerStatus>,
    pub embedding_model: Option<String>,
    pub synthesis_model: String,
}

// ---------------------------------------------------------------------------
// Request-scoped context
// ---------------------------------------------------------------------------

/// What one executed step produced.
enum StepResult {
    Rows(RowSet),
    Empty,
    Failed(ExecError),
}

struct Executed {
    result: StepResult,
    statement: String,
    recency_fallback: bool,
}

/// Everything one question accumulates. Never shared between requests.
struct EscalationContext {
    request_id: Uuid,
    attempts: Vec<ExecutionAttempt>,
    /// Most recent template from a ladder rung (repairs excluded)
    template: Option<QueryTemplate>,
    statement: Option<String>,
    reason: Option<String>,
    last_statement: Option<String>,
    /// How the last executed statement ended: empty, or with an error
    last_executed: Option<Result<(), ExecError>>,
    /// Most recent synthesis failure
    synthesis_error: Option<ExecError>,
}

impl EscalationContext {
    fn new(request_id: Uuid) -> Self {
        EscalationContext {
            request_id,
            attempts: Vec::new(),
            template: None,
            statement: None,
            reason: None,
            last_statement: None,
            last_executed: None,
            synthesis_error: None,
        }
    }

    fn prior(&self) -> Prior<'_> {
        Prior {
            template: self.template.as_ref(),
            statement: self.statement.as_deref(),
            reason: self.reason.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<C: Connector> {
    executor: QueryExecutor<C>,
    materializer: Materializer,
    synthesizer: Arc<dyn QuerySynthesizer>,
    repair: Arc<dyn RepairStep>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    external: Arc<CircuitBreaker>,
    identifiers: IdentifierMatcher,
    schema: String,
    escalation: EscalationConfig,
}

impl<C: Connector> Engine<C> {
    /// Assemble an engine around an executor. Without the `with_*` calls
    /// there is no embedding and the identifier rung never fires.
    pub fn new(
        executor: QueryExecutor<C>,
        materializer: Materializer,
        synthesizer: Arc<dyn QuerySynthesizer>,
        repair: Arc<dyn RepairStep>,
    ) -> Self {
        Engine {
            executor,
            materializer,
            synthesizer,
            repair,
            embedder: None,
            external: Arc::new(CircuitBreaker::new(crate::config::BreakerConfig::external_api())),
            identifiers: IdentifierMatcher::disabled(),
            schema: String::new(),
            escalation: EscalationConfig::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_external_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.external = breaker;
        self
    }

    pub fn with_identifiers(mut self, identifiers: IdentifierMatcher) -> Self {
        self.identifiers = identifiers;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    /// Build every component from configuration around `connector`.
    ///
    /// Nothing connects here; the pool opens on the first question.
    pub fn from_config(config: &Config, connector: C) -> Result<Self, VecqueryError> {
        let pool = Arc::new(ConnectionPool::new(connector, config.pool.clone()));
        let database_breaker = Arc::new(CircuitBreaker::new(config.breakers.database.clone()));
        let executor = QueryExecutor::new(pool, database_breaker, &config.database, config.shrink.clone());

        let schema = synthesis::load_schema(&config.synthesis)?;
        let (synthesizer, repair) = synthesis::build_providers(&config.synthesis, &schema);
        let embedder = match embedding::build_provider(&config.embedding) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(error = %e, "Embedding unavailable, using recency ordering");
                None
            }
        };

        Ok(Engine::new(executor, Materializer::new(&config.materialize), synthesizer, repair)
            .with_embedder(embedder)
            .with_external_breaker(Arc::new(CircuitBreaker::new(config.breakers.external_api.clone())))
            .with_identifiers(IdentifierMatcher::new(&config.escalation.fuzzy_id)?)
            .with_schema(schema)
            .with_escalation(config.escalation.clone()))
    }

    pub fn executor(&self) -> &QueryExecutor<C> {
        &self.executor
    }

    /// Answer one question. Every path ends in a typed outcome.
    pub async fn answer(&self, question: &str) -> Outcome {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("answer", request_id = %request_id);
        self.escalate(request_id, question.trim()).instrument(span).await
    }

    async fn escalate(&self, request_id: Uuid, question: &str) -> Outcome {
        let mut ctx = EscalationContext::new(request_id);
        if question.is_empty() {
            let error = ExecError::new(ErrorClass::Other, "question cannot be empty");
            return Outcome::failed(request_id, error, ctx.attempts);
        }

        let (embedding, first) = tokio::join!(
            self.embed(question),
            self.synthesize(question, "", Constraint::None)
        );
        let embedding = embedding.as_deref();
        let mut first = Some(first);

        for strategy in Strategy::LADDER {
            let synthesized = match first.take() {
                Some(first) => first,
                None => match strategy::plan(strategy, question, &ctx.prior(), &self.identifiers) {
                    Plan::Synthesize { constraint, context } => {
                        self.synthesize(question, &context, constraint).await
                    }
                    Plan::Execute(template) => Ok(template),
                    Plan::Skip(why) => {
                        tracing::debug!(strategy = %strategy, reason = why, "Strategy skipped");
                        let mut attempt = ExecutionAttempt::new(strategy, false);
                        attempt.skipped = Some(why.to_string());
                        ctx.attempts.push(attempt);
                        continue;
                    }
                },
            };

            let template = match synthesized {
                Ok(template) => template,
                Err(e) => {
                    let error = ExecError::new(ErrorClass::Other, format!("query synthesis failed: {}", e));
                    tracing::warn!(strategy = %strategy, error = %error.reason, "Synthesis failed");
                    let mut attempt = ExecutionAttempt::new(strategy, false);
                    attempt.error = Some(error.clone());
                    ctx.attempts.push(attempt);
                    ctx.reason = Some(error.reason.clone());
                    ctx.synthesis_error = Some(error);
                    continue;
                }
            };

            ctx.template = Some(template.clone());
            let executed = self.run(&mut ctx, strategy, false, &template, embedding).await;
            ctx.statement = Some(executed.statement.clone());

            let error = match executed.result {
                StepResult::Rows(rows) => {
                    return self.rows(ctx, strategy, false, executed.statement, executed.recency_fallback, rows);
                }
                StepResult::Empty => {
                    ctx.reason = Some("statement returned no rows".to_string());
                    continue;
                }
                StepResult::Failed(error) => error,
            };

            ctx.reason = Some(error.reason.clone());
            if error.class.short_circuits() {
                return Outcome::failed(request_id, error, ctx.attempts);
            }

            if strategy == Strategy::Original && error.class == ErrorClass::Repairable {
                let Some(repaired) = self.repair(question, &template, &error.reason).await else {
                    continue;
                };
                let executed = self.run(&mut ctx, strategy, true, &repaired, embedding).await;
                match executed.result {
                    StepResult::Rows(rows) => {
                        return self.rows(ctx, strategy, true, executed.statement, executed.recency_fallback, rows)
                    }
                    StepResult::Failed(e) if e.class.short_circuits() => {
                        return Outcome::failed(request_id, e, ctx.attempts);
                    }
                    // the ladder resumes from the original template and its error
                    _ => {}
                }
            }
        }

        self.terminal(ctx, question)
    }

    /// Materialize and execute one template, recording the attempt.
    async fn run(
        &self,
        ctx: &mut EscalationContext,
        strategy: Strategy,
        repair: bool,
        template: &QueryTemplate,
        embedding: Option<&[f32]>,
    ) -> Executed {
        let query = self.materializer.materialize(template, embedding);
        let statement = query.redacted();
        let started = tokio::time::Instant::now();

        let result = match self.executor.execute(&query).await {
            Ok(rows) if rows.is_empty() => StepResult::Empty,
            Ok(rows) => StepResult::Rows(rows),
            Err(e) => StepResult::Failed(e),
        };

        let mut attempt = ExecutionAttempt::new(strategy, repair);
        attempt.template = Some(template.raw_text().to_string());
        attempt.statement = Some(statement.clone());
        attempt.recency_fallback = Some(query.recency_fallback);
        attempt.elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            StepResult::Rows(rows) => attempt.rows = Some(rows.total),
            StepResult::Empty => attempt.rows = Some(0),
            StepResult::Failed(e) => attempt.error = Some(e.clone()),
        }

        tracing::info!(
            strategy = %strategy,
            repair,
            recency_fallback = query.recency_fallback,
            rows = attempt.rows.unwrap_or(0),
            elapsed_ms = attempt.elapsed_ms,
            failed = attempt.error.is_some(),
            "Attempt finished"
        );

        ctx.attempts.push(attempt);
        ctx.last_statement = Some(statement.clone());
        ctx.last_executed = match &result {
            StepResult::Failed(e) => Some(Err(e.clone())),
            _ => Some(Ok(())),
        };

        Executed {
            result,
            statement,
            recency_fallback: query.recency_fallback,
        }
    }

    fn rows(
        &self,
        ctx: EscalationContext,
        strategy: Strategy,
        repaired: bool,
        statement: String,
        recency_fallback: bool,
        result: RowSet,
    ) -> Outcome {
        tracing::info!(strategy = %strategy, repaired, rows = result.total, "Question answered");
        Outcome::Rows {
            request_id: ctx.request_id,
            strategy,
            repaired,
            statement,
            recency_fallback,
            result,
            attempts: ctx.attempts,
        }
    }

    /// Ladder exhausted: no rows if the last executed statement came back
    /// empty, otherwise the last classified error.
    fn terminal(&self, ctx: EscalationContext, question: &str) -> Outcome {
        let error = match ctx.last_executed {
            Some(Err(error)) => Some(error),
            Some(Ok(())) => None,
            None => ctx.synthesis_error,
        };
        match error {
            Some(error) => {
                tracing::warn!(class = %error.class, "Ladder exhausted with an error");
                Outcome::failed(ctx.request_id, error, ctx.attempts)
            }
            None => {
                let search_hint = self.search_hint(question);
                tracing::info!(search_hint = %search_hint, "Ladder exhausted without rows");
                Outcome::NoResults {
                    request_id: ctx.request_id,
                    statement: ctx.last_statement,
                    search_hint,
                    attempts: ctx.attempts,
                }
            }
        }
    }

    /// External search suggestion for a question the store could not answer.
    pub fn search_hint(&self, question: &str) -> String {
        match self.identifiers.detect(question) {
            Some(found) => self
                .escalation
                .search_hint_with_id
                .replace("{id}", &found.id)
                .replace("{scope}", found.scope.as_deref().unwrap_or(""))
                .replace("{question}", question)
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
            None => self.escalation.search_hint.replace("{question}", question),
        }
    }

    // -----------------------------------------------------------------------
    // External calls, all through the external_api breaker
    // -----------------------------------------------------------------------

    /// Question embedding, or None (recency ordering) on any failure.
    async fn embed(&self, question: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match self.external.call(|| embedder.embed(question)).await {
            Ok(vector) if !vector.is_empty() => Some(vector),
            Ok(_) => {
                tracing::warn!("Embedding provider returned an empty vector");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Embedding failed, falling back to recency ordering");
                None
            }
        }
    }

    async fn synthesize(&self, question: &str, context: &str, constraint: Constraint) -> Result<QueryTemplate, SynthesisError> {
        self.external
            .call_classified(
                || self.synthesizer.synthesize(question, context, constraint),
                SynthesisError::is_outage,
            )
            .await
            .map_err(flatten_breaker)
    }

    /// Single repair attempt; None when the step declines or fails.
    async fn repair(&self, question: &str, failed: &QueryTemplate, reason: &str) -> Option<QueryTemplate> {
        let repaired = self
            .external
            .call_classified(
                || self.repair.repair(question, failed, reason, &self.schema),
                SynthesisError::is_outage,
            )
            .await
            .map_err(flatten_breaker);
        match repaired {
            Ok(Some(template)) if template != *failed => Some(template),
            Ok(_) => {
                tracing::info!("Repair step produced no new statement");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Repair step failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status and lifecycle
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            pool: self.executor.pool().stats().await,
            breakers: vec![self.executor.breaker().status(), self.external.status()],
            embedding_model: self.embedder.as_ref().map(|e| e.model_name().to_string()),
            synthesis_model: self.synthesizer.model_name().to_string(),
        }
    }

    /// Acquire and release one connection.
    pub async fn check(&self) -> Result<(), ExecError> {
        self.executor.check().await
    }

    pub async fn close(&self) {
        self.executor.pool().close().await;
    }
}

fn flatten_breaker(e: BreakerError<SynthesisError>) -> SynthesisError {
    match e {
        BreakerError::Inner(inner) => inner,
        open @ BreakerError::Open { .. } => SynthesisError::Generation(open.to_string()),
    }
}
