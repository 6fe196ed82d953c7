//! Error types for the tracing core

use thiserror::Error;

/// Result type alias for the tracing core
pub type Result<T> = std::result::Result<T, TraceError>;

/// Main error type for the tracing core
///
/// These errors describe faults internal to the instrumentation itself.
/// Faults raised by a wrapped client call are never converted into this
/// type; they are returned to the caller unchanged.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A recorded original could not be restored during uninstall
    #[error("failed to restore {target}.{method}: {reason}")]
    RestoreFailed {
        target: String,
        method: String,
        reason: String,
    },

    /// A declared metric entry was missing required fields
    #[error("invalid metric entry: {0}")]
    InvalidMetric(String),

    /// The cost table could not be loaded or parsed
    #[error("cost table error: {0}")]
    CostTable(String),

    /// A shared lock was poisoned by a panicking holder
    #[error("poisoned lock: {0}")]
    PoisonedLock(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TraceError::RestoreFailed {
            target: "openai.chat.completions".to_string(),
            method: "create".to_string(),
            reason: "slot lock poisoned".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to restore openai.chat.completions.create: slot lock poisoned"
        );

        let err = TraceError::InvalidMetric("missing `score`".to_string());
        assert_eq!(err.to_string(), "invalid metric entry: missing `score`");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TraceError = serde_err.into();
        assert!(matches!(err, TraceError::Serialization(_)));
    }

    #[test]
    fn test_result_type() {
        fn example_function() -> Result<String> {
            Ok("success".to_string())
        }

        let result = example_function();
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "success");
    }
}
