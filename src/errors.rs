/// Crate-level error types for vecquery
///
/// Component errors (pool, breaker, executor, providers) are their own enums;
/// this type is what configuration, startup and the tool surface speak.

use crate::executor::{ErrorClass, ExecError};

#[derive(Debug, thiserror::Error)]
pub enum VecqueryError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<ExecError> for VecqueryError {
    fn from(e: ExecError) -> Self {
        match e.class {
            ErrorClass::Other => VecqueryError::Internal(e.reason),
            _ => VecqueryError::Storage(e.to_string()),
        }
    }
}

impl VecqueryError {
    /// Helper to create validation errors with field names
    ///
    /// Example:
    /// ```
    /// use vecquery::errors::VecqueryError;
    /// let err = VecqueryError::validation("question", "Question cannot be empty");
    /// ```
    pub fn validation(field: &str, message: &str) -> Self {
        VecqueryError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FatalKind;

    #[test]
    fn test_exec_errors_map_to_storage() {
        let fatal = ExecError::new(ErrorClass::Fatal(FatalKind::Auth), "password authentication failed");
        let err = VecqueryError::from(fatal);
        assert!(matches!(err, VecqueryError::Storage(_)));
        assert!(err.to_string().contains("authentication"));

        let other = VecqueryError::from(ExecError::new(ErrorClass::Other, "unexpected"));
        assert!(matches!(other, VecqueryError::Internal(_)));
    }
}
