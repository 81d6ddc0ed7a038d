pub mod breaker;
pub mod config;
pub mod embedding;
pub mod errors;
pub mod escalation;
pub mod executor;
pub mod logging;
pub mod pool;
pub mod query;
pub mod server;
pub mod synthesis;
