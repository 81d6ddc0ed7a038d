use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use vecquery::config::Config;
use vecquery::errors::VecqueryError;
use vecquery::escalation::{Engine, Outcome};
use vecquery::logging;
use vecquery::pool::PgConnector;
use vecquery::server::QueryService;
use rmcp::ServiceExt;

#[derive(Parser)]
#[command(name = "vecquery", version, about = "Resilient vector-aware SQL execution engine for LLM agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question and print the outcome as JSON
    Ask {
        /// Natural-language question
        question: String,
        /// Leave the per-attempt trail out of the output
        #[arg(long)]
        no_attempts: bool,
    },
    /// Print connection pool and circuit breaker status
    Status,
    /// Acquire and release one connection to verify connectivity
    Check,
}

/// Build the engine around a PostgreSQL connector. Nothing connects yet.
fn build_engine(config: &Config) -> Result<Arc<Engine<PgConnector>>> {
    let connector = PgConnector::from_config(&config.database)?;
    tracing::info!(target_db = %config.database.display_target(), "Database configured");
    Ok(Arc::new(Engine::from_config(config, connector)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        Config::default()
    });

    // 3. Initialize logging FIRST (before any other output)
    // stdout is reserved for JSON-RPC and command output
    logging::init_logging(&config);

    let engine = build_engine(&config)?;

    // 4. Handle subcommands
    match cli.command {
        Some(Commands::Ask { question, no_attempts }) => {
            let outcome = engine.answer(&question).await;
            let mut value = serde_json::to_value(&outcome)?;
            if no_attempts {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("attempts");
                }
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
            engine.close().await;
            if matches!(outcome, Outcome::Failed { .. }) {
                std::process::exit(1);
            }
        }

        Some(Commands::Status) => {
            let status = engine.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Some(Commands::Check) => {
            let result = engine.check().await;
            engine.close().await;
            result.map_err(VecqueryError::from)?;
            println!("Connection OK: {}", config.database.display_target());
        }

        None => {
            // Default: start the MCP server
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "vecquery server starting"
            );

            let service = QueryService::new(engine.clone());

            // Serve via stdio transport
            let (stdin, stdout) = rmcp::transport::io::stdio();
            let server = service.serve((stdin, stdout)).await?;

            tracing::info!("vecquery server running, awaiting tool calls via stdio");

            // Wait for shutdown (client disconnects or signal)
            tokio::select! {
                result = server.waiting() => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupt received, shutting down");
                }
            }

            engine.close().await;
            tracing::info!("vecquery server stopped");
        }
    }

    Ok(())
}
