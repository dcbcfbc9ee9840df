//! Error types for locpipe
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in locpipe
#[derive(Debug, Error)]
pub enum LocPipeError {
    /// Missing or invalid configuration (env vars, YAML files)
    #[error("Config error: {0}")]
    Config(String),

    /// Input CSV failed pre-flight validation (missing columns, duplicate ids)
    #[error("Input validation error: {0}")]
    InputValidation(String),

    /// Placeholder schema could not be loaded or compiled
    #[error("Schema error: {0}")]
    Schema(String),

    /// A token in a translated text has no mapping entry
    #[error("Unknown token '{token}' in row {row} (string_id '{string_id}')")]
    UnknownToken {
        token: String,
        row: usize,
        string_id: String,
    },

    /// Hard QA failed after repair exhaustion
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Storage/persistence error (cache, checkpoint, reports)
    #[error("Storage error: {0}")]
    Storage(String),

    /// LLM transport error with retry/fallback hints
    #[error("LLM error ({}): {message}", kind.as_str())]
    Llm {
        kind: LlmErrorKind,
        message: String,
        retryable: bool,
        http_status: Option<u16>,
    },

    /// Response text could not be parsed into the expected items shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// The run was cancelled before completion
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Classification of LLM transport failures.
///
/// The scheduler and router route on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    /// Missing configuration; not retryable
    Config,
    /// HTTP deadline exceeded; retryable
    Timeout,
    /// Socket/DNS failure; retryable
    Network,
    /// 429/5xx from the endpoint; retryable
    Upstream,
    /// 4xx other than 429; not retryable
    Http,
    /// Response body was not the expected shape; retryable
    Parse,
}

impl LlmErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorKind::Config => "config",
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::Network => "network",
            LlmErrorKind::Upstream => "upstream",
            LlmErrorKind::Http => "http",
            LlmErrorKind::Parse => "parse",
        }
    }
}

impl LocPipeError {
    /// Build an LLM error with its retry hint derived from the kind.
    pub fn llm(kind: LlmErrorKind, message: impl Into<String>, http_status: Option<u16>) -> Self {
        let retryable = matches!(
            kind,
            LlmErrorKind::Timeout | LlmErrorKind::Network | LlmErrorKind::Upstream | LlmErrorKind::Parse
        );
        LocPipeError::Llm {
            kind,
            message: message.into(),
            retryable,
            http_status,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LocPipeError::Llm { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Result type alias for locpipe operations
pub type Result<T> = std::result::Result<T, LocPipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error() {
        let err = LocPipeError::Config("missing LLM_BASE_URL".to_string());
        assert_eq!(err.to_string(), "Config error: missing LLM_BASE_URL");
    }

    #[test]
    fn test_unknown_token_error() {
        let err = LocPipeError::UnknownToken {
            token: "PH_999".to_string(),
            row: 4,
            string_id: "ui.title".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown token 'PH_999' in row 4 (string_id 'ui.title')"
        );
    }

    #[test]
    fn test_llm_error_retryable_by_kind() {
        assert!(LocPipeError::llm(LlmErrorKind::Timeout, "deadline", None).is_retryable());
        assert!(LocPipeError::llm(LlmErrorKind::Network, "dns", None).is_retryable());
        assert!(LocPipeError::llm(LlmErrorKind::Upstream, "429", Some(429)).is_retryable());
        assert!(LocPipeError::llm(LlmErrorKind::Parse, "bad json", None).is_retryable());
        assert!(!LocPipeError::llm(LlmErrorKind::Http, "403", Some(403)).is_retryable());
        assert!(!LocPipeError::llm(LlmErrorKind::Config, "no key", None).is_retryable());
    }

    #[test]
    fn test_llm_error_display() {
        let err = LocPipeError::llm(LlmErrorKind::Upstream, "HTTP 503", Some(503));
        assert_eq!(err.to_string(), "LLM error (upstream): HTTP 503");
    }

    #[test]
    fn test_kind_as_str() {
        assert_eq!(LlmErrorKind::Timeout.as_str(), "timeout");
        assert_eq!(LlmErrorKind::Http.as_str(), "http");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LocPipeError = io_err.into();
        assert!(matches!(err, LocPipeError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: LocPipeError = json_err.into();
        assert!(matches!(err, LocPipeError::Json(_)));
    }

    #[test]
    fn test_non_llm_errors_not_retryable() {
        let err = LocPipeError::Storage("locked".to_string());
        assert!(!err.is_retryable());
    }
}
