/// Error classification at the driver boundary
///
/// Driver, pool and breaker errors are mapped once, here, into `ErrorClass`.
/// Everything downstream (breaker accounting, connection disposal, the
/// escalation ladder) branches on the class only.

use serde::Serialize;
use std::fmt;

use crate::breaker::BreakerError;
use crate::pool::{DriverError, DriverErrorKind, PoolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Timeout,
    Auth,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "class", content = "kind", rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retrying with another statement cannot help
    Fatal(FatalKind),
    /// Statement problem a repair step may fix
    Repairable,
    /// Pool exhausted, in backoff, closed, or the circuit is open
    PoolUnavailable,
    Other,
}

impl ErrorClass {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Fatal(_))
    }

    /// Classes that end the escalation ladder immediately.
    pub fn short_circuits(self) -> bool {
        matches!(self, ErrorClass::Fatal(_) | ErrorClass::PoolUnavailable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Fatal(FatalKind::Timeout) => write!(f, "timeout"),
            ErrorClass::Fatal(FatalKind::Auth) => write!(f, "authentication"),
            ErrorClass::Fatal(FatalKind::Connection) => write!(f, "connection"),
            ErrorClass::Repairable => write!(f, "repairable"),
            ErrorClass::PoolUnavailable => write!(f, "pool_unavailable"),
            ErrorClass::Other => write!(f, "other"),
        }
    }
}

/// A classified execution failure with a redacted, human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{class} error: {reason}")]
pub struct ExecError {
    pub class: ErrorClass,
    pub reason: String,
    /// SQLSTATE, when the server reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ExecError {
    pub fn new(class: ErrorClass, reason: impl Into<String>) -> Self {
        ExecError {
            class,
            reason: crate::query::sql::redact(&reason.into()),
            code: None,
        }
    }

    /// Statement guard rejection; never reaches the database.
    pub fn rejected(reason: impl Into<String>) -> Self {
        ExecError::new(ErrorClass::Repairable, format!("statement rejected: {}", reason.into()))
    }

    pub fn deadline(after_ms: u64) -> Self {
        ExecError::new(
            ErrorClass::Fatal(FatalKind::Timeout),
            format!("statement exceeded client deadline of {}ms", after_ms),
        )
    }

    /// Counted by the database breaker.
    pub fn is_breaker_failure(&self) -> bool {
        self.class.is_fatal()
    }
}

impl From<DriverError> for ExecError {
    fn from(e: DriverError) -> Self {
        ExecError {
            class: classify_driver(&e),
            reason: e.message,
            code: e.code,
        }
    }
}

impl From<PoolError> for ExecError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::ConnectFailed(driver) => {
                // anything that stops a connection from being established is fatal
                let class = match classify_driver(&driver) {
                    ErrorClass::Fatal(kind) => ErrorClass::Fatal(kind),
                    _ => ErrorClass::Fatal(FatalKind::Connection),
                };
                ExecError {
                    class,
                    reason: format!("failed to connect: {}", driver.message),
                    code: driver.code,
                }
            }
            other => ExecError::new(ErrorClass::PoolUnavailable, other.to_string()),
        }
    }
}

impl From<BreakerError<ExecError>> for ExecError {
    fn from(e: BreakerError<ExecError>) -> Self {
        match e {
            BreakerError::Inner(inner) => inner,
            open @ BreakerError::Open { .. } => ExecError::new(ErrorClass::PoolUnavailable, open.to_string()),
        }
    }
}

/// Map a driver error onto its class by SQLSTATE, or by transport kind.
pub fn classify_driver(e: &DriverError) -> ErrorClass {
    match e.kind {
        DriverErrorKind::Database => classify_sqlstate(e.code.as_deref().unwrap_or_default()),
        DriverErrorKind::Io | DriverErrorKind::Tls | DriverErrorKind::Protocol => {
            ErrorClass::Fatal(FatalKind::Connection)
        }
        DriverErrorKind::Timeout => ErrorClass::Fatal(FatalKind::Timeout),
        DriverErrorKind::Other => ErrorClass::Other,
    }
}

pub fn classify_sqlstate(code: &str) -> ErrorClass {
    match code {
        // query_canceled (statement_timeout), lock_not_available (lock_timeout)
        "57014" | "55P03" => ErrorClass::Fatal(FatalKind::Timeout),
        "28P01" | "28000" => ErrorClass::Fatal(FatalKind::Auth),
        // admin/crash shutdown, cannot connect now
        "57P01" | "57P02" | "57P03" => ErrorClass::Fatal(FatalKind::Connection),
        c if c.starts_with("08") || c.starts_with("53") => ErrorClass::Fatal(FatalKind::Connection),
        c if c.starts_with("42") || c.starts_with("22") => ErrorClass::Repairable,
        _ => ErrorClass::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sqlstate_classes() {
        assert_eq!(classify_sqlstate("57014"), ErrorClass::Fatal(FatalKind::Timeout));
        assert_eq!(classify_sqlstate("28P01"), ErrorClass::Fatal(FatalKind::Auth));
        assert_eq!(classify_sqlstate("08006"), ErrorClass::Fatal(FatalKind::Connection));
        assert_eq!(classify_sqlstate("53300"), ErrorClass::Fatal(FatalKind::Connection));
        assert_eq!(classify_sqlstate("42601"), ErrorClass::Repairable);
        assert_eq!(classify_sqlstate("42703"), ErrorClass::Repairable);
        assert_eq!(classify_sqlstate("22P02"), ErrorClass::Repairable);
        assert_eq!(classify_sqlstate("40001"), ErrorClass::Other);
    }

    #[test]
    fn test_transport_errors_are_connection_fatal() {
        for kind in [DriverErrorKind::Io, DriverErrorKind::Tls, DriverErrorKind::Protocol] {
            let e = ExecError::from(DriverError::new(kind, "broken pipe"));
            assert_eq!(e.class, ErrorClass::Fatal(FatalKind::Connection));
            assert!(e.is_breaker_failure());
        }
    }

    #[test]
    fn test_pool_errors() {
        let exhausted = ExecError::from(PoolError::PoolExhausted { waited_ms: 5000 });
        assert_eq!(exhausted.class, ErrorClass::PoolUnavailable);
        assert!(!exhausted.is_breaker_failure());

        let backoff = ExecError::from(PoolError::PoolInBackoff {
            failures: 3,
            retry_after: Duration::from_secs(12),
        });
        assert_eq!(backoff.class, ErrorClass::PoolUnavailable);
        assert!(backoff.reason.contains("12s"));

        let auth = ExecError::from(PoolError::ConnectFailed(DriverError::database(
            "28P01",
            "password authentication failed for user \"agent\"",
        )));
        assert_eq!(auth.class, ErrorClass::Fatal(FatalKind::Auth));

        let missing_db = ExecError::from(PoolError::ConnectFailed(DriverError::database(
            "3D000",
            "database \"gov\" does not exist",
        )));
        assert_eq!(missing_db.class, ErrorClass::Fatal(FatalKind::Connection));
    }

    #[test]
    fn test_reasons_are_redacted() {
        let e = ExecError::from(DriverError::new(
            DriverErrorKind::Io,
            "could not reach postgres://agent:hunter2@db:5432/gov",
        ));
        assert!(!e.reason.contains("hunter2"), "{}", e.reason);

        let rejected = ExecError::rejected("forbidden keyword DROP");
        assert_eq!(rejected.class, ErrorClass::Repairable);
    }

    #[test]
    fn test_class_serialization() {
        let json = serde_json::to_value(ErrorClass::Fatal(FatalKind::Auth)).unwrap();
        assert_eq!(json, serde_json::json!({"class": "fatal", "kind": "auth"}));
        let json = serde_json::to_value(ErrorClass::Repairable).unwrap();
        assert_eq!(json, serde_json::json!({"class": "repairable"}));
    }
}
